// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PBKDF2-HMAC-SHA256 password hashing (`spec.md` §4.3 step 3), the same
//! primitive the pack's SASL/SCRAM module uses for its own key derivation.

use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

const ITERATIONS: u32 = 10_000;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub fn hash_password(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; KEY_LEN];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, ITERATIONS, &mut out)
        .expect("HMAC can accept any key length");
    out
}

/// Derives a key from `password`/`salt` and compares it to `expected_hash`
/// in constant time, so a byte-by-byte early return can't leak which byte
/// of the stored hash differs first (`spec.md` §4.3 step 3).
pub fn verify_password(password: &str, salt: &[u8], expected_hash: &[u8]) -> bool {
    let derived = hash_password(password, salt);
    derived.len() == expected_hash.len() && derived.ct_eq(expected_hash).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hash_and_verify() {
        let salt = generate_salt();
        let hash = hash_password("correct horse battery staple", &salt);
        assert!(verify_password("correct horse battery staple", &salt, &hash));
        assert!(!verify_password("wrong password", &salt, &hash));
    }

    #[test]
    fn salts_are_not_all_zero_and_vary_per_call() {
        let a = generate_salt();
        let b = generate_salt();
        assert_ne!(a, b);
        assert!(a.iter().any(|&b| b != 0));
    }

    #[test]
    fn verify_password_rejects_mismatched_hash_length() {
        let salt = generate_salt();
        assert!(!verify_password("correct horse battery staple", &salt, b"too-short"));
    }
}
