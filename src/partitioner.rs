// Tessera - Replicated key-value store over a token ring, with tunable consistency and a minimal binary peer protocol
// Copyright (C) 2024  tessera authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use rand::Rng;

/// A point on the circular key space.
pub type Token = u128;

/// Maps keys onto the token ring.
///
/// Every node in a cluster must use the same partitioner, otherwise
/// their views of key ownership diverge.
pub trait Partitioner: Send + Sync {
    /// Inclusive upper bound of the token space.
    fn max_token(&self) -> Token;

    /// The ring position of a key.
    fn token_of(&self, key: &str) -> Token;

    /// A uniformly random ring position, for nodes started without an
    /// explicit token.
    fn random_token(&self) -> Token {
        rand::thread_rng().gen_range(0..=self.max_token())
    }
}

/// Default partitioner: the 16 MD5 digest bytes composed big-endian
/// into a 128-bit token.
pub struct Md5Partitioner;

impl Partitioner for Md5Partitioner {
    fn max_token(&self) -> Token {
        u128::MAX
    }

    fn token_of(&self, key: &str) -> Token {
        let digest = md5::compute(key.as_bytes());

        u128::from_be_bytes(digest.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_tokens_compose_the_digest() {
        let partitioner = Md5Partitioner;

        let expected = u128::from_be_bytes(md5::compute(b"foo").0);

        assert_eq!(partitioner.token_of("foo"), expected);
        assert_ne!(partitioner.token_of("foo"), partitioner.token_of("bar"));
    }

    #[test]
    fn md5_tokens_are_stable() {
        let partitioner = Md5Partitioner;

        assert_eq!(partitioner.token_of("key"), partitioner.token_of("key"));
    }

    #[test]
    fn random_tokens_respect_the_bound() {
        struct Small;

        impl Partitioner for Small {
            fn max_token(&self) -> Token {
                10_000
            }

            fn token_of(&self, _key: &str) -> Token {
                0
            }
        }

        for _ in 0..100 {
            assert!(Small.random_token() <= 10_000);
        }
    }
}
