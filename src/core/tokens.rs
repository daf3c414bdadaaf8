//! Write tokens binding stores and removes to a previous lookup from the same address.

use crc::{Crc, CRC_32_ISCSI};
use rand::{thread_rng, Rng};
use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::common::Token;

const SECRET_SIZE: usize = 20;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// How often the secret rotates. A token stays valid for up to two intervals.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Tokens generator.
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    pub fn new() -> Self {
        let mut rng = thread_rng();

        Tokens {
            prev_secret: rng.gen(),
            curr_secret: rng.gen(),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    pub fn should_update(&self) -> bool {
        self.should_update_at(Instant::now())
    }

    pub fn should_update_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_updated) > TOKEN_ROTATE_INTERVAL
    }

    /// Validate that the token was generated for this address with the
    /// current or the previous secret.
    pub fn validate(&self, address: SocketAddr, token: &Token) -> bool {
        let prev = generate(address.ip(), &self.prev_secret);
        let curr = generate(address.ip(), &self.curr_secret);

        token == &curr || token == &prev
    }

    pub fn rotate(&mut self) {
        trace!("Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = thread_rng().gen();

        self.last_updated = Instant::now();
    }

    pub fn generate_token(&self, address: SocketAddr) -> Token {
        generate(address.ip(), &self.curr_secret)
    }
}

fn generate(ip: IpAddr, secret: &[u8; SECRET_SIZE]) -> Token {
    let mut digest = CASTAGNOLI.digest();

    match ip {
        IpAddr::V4(v4) => digest.update(&v4.octets()),
        IpAddr::V6(v6) => digest.update(&v6.octets()),
    };

    digest.update(secret);

    digest.finalize().to_be_bytes()
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_tokens() {
        let tokens = Tokens::new();

        let address = SocketAddr::from(([127, 0, 0, 1], 6881));
        let token = tokens.generate_token(address);

        assert!(tokens.validate(address, &token));

        // Only the IP matters.
        assert!(tokens.validate(SocketAddr::from(([127, 0, 0, 1], 1)), &token));
        assert!(!tokens.validate(SocketAddr::from(([127, 0, 0, 2], 6881)), &token));
    }

    #[test]
    fn previous_secret_still_valid() {
        let mut tokens = Tokens::new();
        let address = SocketAddr::from(([10, 0, 0, 1], 6881));

        let token = tokens.generate_token(address);

        tokens.rotate();
        assert!(tokens.validate(address, &token));

        tokens.rotate();
        assert!(!tokens.validate(address, &token));
    }

    #[test]
    fn rotation_schedule() {
        let tokens = Tokens::new();
        let now = Instant::now();

        assert!(!tokens.should_update_at(now));
        assert!(tokens.should_update_at(now + TOKEN_ROTATE_INTERVAL + Duration::from_secs(1)));
    }
}
