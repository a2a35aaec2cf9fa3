//! Shamir three-pass commutative locks.
//!
//! A lock is exponentiation modulo a shared prime `p`: `lock(x, e) = x^e mod p`,
//! undone by `d = e^-1 mod (p-1)`. Locks commute, so client and server can
//! add and remove theirs in any order and neither ever sees the other's
//! exponent or the plain KEK.
//!
//! ```text
//! encrypt:  KEK ─e_c─▶ ClientLocked ─e_s─▶ DoubleLocked ─d_c─▶ ServerLocked (stored)
//! decrypt:  ServerLocked ─e_c'─▶ DoubleLocked ─d_s─▶ ClientLocked ─d_c'─▶ KEK
//! ```
//!
//! Each state is its own type so a value can only move along the arrows.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::One;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{decode_biguint_b64u, encode_biguint_b64u, EscrowError};

/// RFC 3526 group 14 (2048-bit MODP) safe prime
pub const RFC3526_MODP_2048: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
    0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
    0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
    0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2,
    0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9,
    0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7c,
    0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff,
];

const KEK_AEAD_INFO: &[u8] = b"vrf-authority/shamir-kek-aead-v1";
const AES_NONCE_LEN: usize = 12;
const MAX_KEYGEN_ATTEMPTS: usize = 128;

/// One-time (client) or long-lived (server) exponent pair
#[derive(Clone)]
pub struct LockKeys {
    pub e: BigUint,
    pub d: BigUint,
}

impl std::fmt::Debug for LockKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockKeys").finish_non_exhaustive()
    }
}

/// Key-encryption key as a group element
#[derive(Clone, PartialEq, Eq)]
pub struct Kek(BigUint);

impl Kek {
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Kek(..)")
    }
}

macro_rules! locked_value {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(BigUint);

        impl $name {
            pub fn from_b64u(encoded: &str) -> Result<Self, EscrowError> {
                decode_biguint_b64u(encoded).map(Self)
            }

            pub fn to_b64u(&self) -> String {
                encode_biguint_b64u(&self.0)
            }

            pub fn as_biguint(&self) -> &BigUint {
                &self.0
            }
        }
    };
}

locked_value!(
    /// KEK under the client's lock only; what the server receives on apply
    ClientLocked
);
locked_value!(
    /// KEK under both locks
    DoubleLocked
);
locked_value!(
    /// KEK under the server's lock only; the at-rest form `kek_s`
    ServerLocked
);

/// Any value the server may legitimately see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowedKey {
    ClientLocked(ClientLocked),
    DoubleLocked(DoubleLocked),
}

impl EscrowedKey {
    pub fn to_b64u(&self) -> String {
        match self {
            EscrowedKey::ClientLocked(v) => v.to_b64u(),
            EscrowedKey::DoubleLocked(v) => v.to_b64u(),
        }
    }
}

/// Lock arithmetic over a fixed prime modulus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shamir3Pass {
    p: BigUint,
    p_minus_1: BigUint,
}

impl Default for Shamir3Pass {
    fn default() -> Self {
        let p = BigUint::from_bytes_be(&RFC3526_MODP_2048);
        let p_minus_1 = &p - 1u32;
        Self { p, p_minus_1 }
    }
}

impl Shamir3Pass {
    /// Use a custom modulus; must be an odd value above 3
    pub fn new(p: BigUint) -> Result<Self, EscrowError> {
        if p <= BigUint::from(3u32) || p.is_even() {
            return Err(EscrowError::InvalidModulus(
                "modulus must be an odd prime greater than 3".to_string(),
            ));
        }
        let p_minus_1 = &p - 1u32;
        Ok(Self { p, p_minus_1 })
    }

    pub fn from_b64u(p_b64u: &str) -> Result<Self, EscrowError> {
        Self::new(decode_biguint_b64u(p_b64u)?)
    }

    pub fn modulus(&self) -> &BigUint {
        &self.p
    }

    pub fn p_b64u(&self) -> String {
        encode_biguint_b64u(&self.p)
    }

    /// Reject the trivial elements 0, 1 and p-1 and anything out of range
    pub fn validate_element(&self, x: &BigUint) -> Result<(), EscrowError> {
        if x <= &BigUint::one() || x >= &self.p_minus_1 {
            return Err(EscrowError::InvalidValue(
                "value outside the multiplicative group".to_string(),
            ));
        }
        Ok(())
    }

    /// `e` coprime to `p-1` and its inverse
    pub fn generate_lock_keys(&self) -> Result<LockKeys, EscrowError> {
        let mut rng = rand::thread_rng();
        let low = BigUint::from(3u32);
        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            let e = rng.gen_biguint_range(&low, &self.p_minus_1);
            if !e.gcd(&self.p_minus_1).is_one() {
                continue;
            }
            if let Some(d) = e.modinv(&self.p_minus_1) {
                return Ok(LockKeys { e, d });
            }
        }
        Err(EscrowError::KeyGeneration(
            "no exponent coprime to p-1 found".to_string(),
        ))
    }

    /// Inverse of an exponent mod `p-1`
    pub fn invert_exponent(&self, exponent: &BigUint) -> Result<BigUint, EscrowError> {
        exponent
            .modinv(&self.p_minus_1)
            .ok_or_else(|| EscrowError::InvalidValue("exponent not invertible mod p-1".to_string()))
    }

    pub fn random_kek(&self) -> Kek {
        let low = BigUint::from(2u32);
        Kek(rand::thread_rng().gen_biguint_range(&low, &self.p_minus_1))
    }

    pub fn add_lock(&self, x: &BigUint, e: &BigUint) -> BigUint {
        x.modpow(e, &self.p)
    }

    pub fn remove_lock(&self, x: &BigUint, d: &BigUint) -> BigUint {
        x.modpow(d, &self.p)
    }

    // -- typed transitions ----------------------------------------------------

    pub fn lock_kek(&self, kek: &Kek, client: &LockKeys) -> ClientLocked {
        ClientLocked(self.add_lock(&kek.0, &client.e))
    }

    pub fn apply_server_lock(&self, kek_c: &ClientLocked, e_s: &BigUint) -> DoubleLocked {
        DoubleLocked(self.add_lock(&kek_c.0, e_s))
    }

    pub fn remove_client_lock(&self, kek_cs: &DoubleLocked, client: &LockKeys) -> ServerLocked {
        ServerLocked(self.remove_lock(&kek_cs.0, &client.d))
    }

    pub fn relock_server_locked(&self, kek_s: &ServerLocked, client: &LockKeys) -> DoubleLocked {
        DoubleLocked(self.add_lock(&kek_s.0, &client.e))
    }

    pub fn remove_server_lock(&self, kek_cs: &DoubleLocked, d_s: &BigUint) -> ClientLocked {
        ClientLocked(self.remove_lock(&kek_cs.0, d_s))
    }

    pub fn unlock_kek(&self, kek_c: &ClientLocked, client: &LockKeys) -> Kek {
        Kek(self.remove_lock(&kek_c.0, &client.d))
    }

    // -- AEAD under the KEK ---------------------------------------------------

    fn aead_key(kek: &Kek) -> Result<Zeroizing<[u8; 32]>, EscrowError> {
        let ikm = Zeroizing::new(kek.0.to_bytes_be());
        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(KEK_AEAD_INFO, &mut okm[..])
            .map_err(|e| EscrowError::Encryption(e.to_string()))?;
        Ok(okm)
    }

    /// `nonce || ciphertext` under a key derived from `kek`
    pub fn encrypt_with_kek(&self, plaintext: &[u8], kek: &Kek) -> Result<Vec<u8>, EscrowError> {
        let key = Self::aead_key(kek)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| EscrowError::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; AES_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| EscrowError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(AES_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn encrypt_with_random_kek(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Kek), EscrowError> {
        let kek = self.random_kek();
        let ciphertext = self.encrypt_with_kek(plaintext, &kek)?;
        Ok((ciphertext, kek))
    }

    pub fn decrypt_with_kek(&self, ciphertext: &[u8], kek: &Kek) -> Result<Vec<u8>, EscrowError> {
        if ciphertext.len() <= AES_NONCE_LEN {
            return Err(EscrowError::Decryption("ciphertext too short".to_string()));
        }
        let (nonce_bytes, body) = ciphertext.split_at(AES_NONCE_LEN);
        let key = Self::aead_key(kek)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| EscrowError::Decryption(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| EscrowError::Decryption("authentication tag mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2^127 - 1 keeps the tests fast
    fn small_group() -> Shamir3Pass {
        let p = (BigUint::one() << 127u32) - 1u32;
        Shamir3Pass::new(p).unwrap()
    }

    #[test]
    fn test_default_modulus_is_rfc3526() {
        let shamir = Shamir3Pass::default();
        assert_eq!(shamir.modulus().bits(), 2048);
        assert!(shamir.modulus().is_odd());
    }

    #[test]
    fn test_invalid_modulus_rejected() {
        assert!(Shamir3Pass::new(BigUint::from(3u32)).is_err());
        assert!(Shamir3Pass::new(BigUint::from(1024u32)).is_err());
    }

    #[test]
    fn test_lock_keys_invert() {
        let shamir = small_group();
        let keys = shamir.generate_lock_keys().unwrap();
        let x = BigUint::from(123_456_789u64);
        let locked = shamir.add_lock(&x, &keys.e);
        assert_ne!(locked, x);
        assert_eq!(shamir.remove_lock(&locked, &keys.d), x);
    }

    #[test]
    fn test_three_pass_encrypt_then_decrypt() {
        let shamir = small_group();
        let server = shamir.generate_lock_keys().unwrap();

        // Registration
        let kek = shamir.random_kek();
        let client = shamir.generate_lock_keys().unwrap();
        let kek_c = shamir.lock_kek(&kek, &client);
        let kek_cs = shamir.apply_server_lock(&kek_c, &server.e);
        let kek_s = shamir.remove_client_lock(&kek_cs, &client);

        // Login with fresh one-time client keys
        let client2 = shamir.generate_lock_keys().unwrap();
        let kek_cs2 = shamir.relock_server_locked(&kek_s, &client2);
        let kek_c2 = shamir.remove_server_lock(&kek_cs2, &server.d);
        let recovered = shamir.unlock_kek(&kek_c2, &client2);

        assert_eq!(recovered, kek);
    }

    #[test]
    fn test_server_lock_round_trip() {
        let shamir = small_group();
        let server = shamir.generate_lock_keys().unwrap();
        let kek_c = ClientLocked(BigUint::from(987_654_321u64));
        let kek_cs = shamir.apply_server_lock(&kek_c, &server.e);
        assert_eq!(shamir.remove_server_lock(&kek_cs, &server.d), kek_c);
    }

    #[test]
    fn test_aead_under_kek() {
        let shamir = Shamir3Pass::default();
        let (ciphertext, kek) = shamir.encrypt_with_random_kek(b"vrf keypair bytes").unwrap();
        assert_eq!(
            shamir.decrypt_with_kek(&ciphertext, &kek).unwrap(),
            b"vrf keypair bytes"
        );

        let other = shamir.random_kek();
        assert!(matches!(
            shamir.decrypt_with_kek(&ciphertext, &other),
            Err(EscrowError::Decryption(_))
        ));
    }

    #[test]
    fn test_validate_element() {
        let shamir = small_group();
        assert!(shamir.validate_element(&BigUint::from(0u32)).is_err());
        assert!(shamir.validate_element(&BigUint::one()).is_err());
        assert!(shamir.validate_element(&(shamir.modulus() - 1u32)).is_err());
        assert!(shamir.validate_element(shamir.modulus()).is_err());
        assert!(shamir.validate_element(&BigUint::from(2u32)).is_ok());
    }
}
