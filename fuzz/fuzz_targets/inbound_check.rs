//! Fuzz test for inbound connectivity checks
//!
//! Feeds structured, partly signed binding requests through authentication
//! and the checklist's triggered-check path.

#![no_main]

use arbitrary::Arbitrary;
use icelink_agent::{Candidate, CheckTiming, Checklist, Credentials};
use icelink_stun::{StunAttribute, StunMessage};
use libfuzzer_sys::fuzz_target;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

const LOCAL_PASSWORD: &str = "localpasswordlocalpassword";

#[derive(Debug, Arbitrary)]
struct Check {
    username: Option<String>,
    priority: Option<u32>,
    controlled: Option<u64>,
    controlling: Option<u64>,
    use_candidate: bool,
    sign_correctly: bool,
    fingerprint: bool,
    port: u16,
}

fuzz_target!(|checks: Vec<Check>| {
    let now = Instant::now();
    let mut list = Checklist::new(
        Credentials::new("locl", LOCAL_PASSWORD, "remt", "remotepasswordremotepassword"),
        CheckTiming::default(),
        now,
    );
    let local = Candidate::host(SocketAddr::from((Ipv4Addr::LOCALHOST, 5000)), 65535);

    for check in checks {
        let mut request = StunMessage::binding_request();
        if let Some(username) = check.username {
            request.add_attribute(StunAttribute::Username(username));
        }
        if let Some(priority) = check.priority {
            request.add_attribute(StunAttribute::Priority(priority));
        }
        if let Some(tie_breaker) = check.controlled {
            request.add_attribute(StunAttribute::IceControlled(tie_breaker));
        }
        if let Some(tie_breaker) = check.controlling {
            request.add_attribute(StunAttribute::IceControlling(tie_breaker));
        }
        if check.use_candidate {
            request.add_attribute(StunAttribute::UseCandidate);
        }
        let key: &[u8] = if check.sign_correctly {
            LOCAL_PASSWORD.as_bytes()
        } else {
            b"wrong"
        };
        if request.add_message_integrity(key).is_err() {
            continue;
        }
        if check.fingerprint && request.add_fingerprint().is_err() {
            continue;
        }

        let Ok(raw) = request.encode() else {
            continue;
        };
        let Ok(decoded) = StunMessage::decode(&raw) else {
            continue;
        };
        let from = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), check.port.max(1)));
        match list.authenticate(&decoded, &raw) {
            Ok(()) => {
                let _ = list.success_response(&decoded, from).map(|r| r.encode());
                let remote = Candidate::peer_reflexive(from, decoded.priority().unwrap_or_default());
                let _ = list.handle_inbound_check(&local, &remote, decoded.use_candidate());
            }
            Err(rejection) => {
                let _ = list.error_response(&decoded, rejection).map(|r| r.encode());
            }
        }
        let _ = list.poll(now);
    }
});
