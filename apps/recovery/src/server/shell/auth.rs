use crate::credentials::ShellPassword;
use tracing::{debug, warn};

/// Single shared secret checked by exact byte equality. There is no lockout
/// or backoff; the secret only lives as long as the recovery window.
#[derive(Clone, Debug)]
pub struct PasswordAuthenticator {
    secret: ShellPassword,
}

impl PasswordAuthenticator {
    pub fn new(secret: ShellPassword) -> Self {
        Self { secret }
    }

    pub fn verify(&self, identity: &str, candidate: &[u8]) -> bool {
        let accepted = constant_time_eq(self.secret.as_bytes(), candidate);
        if accepted {
            debug!(user = identity, "password accepted");
        } else {
            warn!(user = identity, "password rejected");
        }
        accepted
    }
}

fn constant_time_eq(expected: &[u8], candidate: &[u8]) -> bool {
    if expected.len() != candidate.len() {
        return false;
    }
    expected
        .iter()
        .zip(candidate)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> PasswordAuthenticator {
        PasswordAuthenticator::new(ShellPassword::new("aB3dE5g"))
    }

    #[test]
    fn accepts_only_the_exact_secret() {
        let auth = authenticator();
        assert!(auth.verify("root", b"aB3dE5g"));
        assert!(auth.verify("anyone", b"aB3dE5g"));
    }

    #[test]
    fn rejects_near_misses() {
        let auth = authenticator();
        let candidates: &[&[u8]] = &[
            b"",
            b"aB3dE5g ",
            b"aB3dE5g\n",
            b" aB3dE5g",
            b"ab3de5g",
            b"aB3dE5",
            b"aB3dE5gg",
            b"aB3dE5g\0",
            &[0xff, 0xfe, 0x00],
        ];
        for candidate in candidates {
            assert!(!auth.verify("root", candidate), "{candidate:?} must be rejected");
        }
    }

    #[test]
    fn repeated_failures_do_not_lock_out() {
        let auth = authenticator();
        for _ in 0..50 {
            assert!(!auth.verify("root", b"wrong"));
        }
        assert!(auth.verify("root", b"aB3dE5g"));
    }
}
