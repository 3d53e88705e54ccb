//! Property tests for the conversation cipher.

use cinder_crypto::cipher::triple_des::{decrypt, encrypt};
use cinder_crypto::CryptoError;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn round_trip(
        message in prop::collection::vec(any::<u8>(), 0..512),
        key in any::<[u8; 24]>(),
        mac_key in any::<[u8; 32]>(),
    ) {
        let sealed = encrypt(&message, &key, &mac_key).unwrap();
        prop_assert_eq!(sealed.ciphertext.len() % 8, 0);
        prop_assert_eq!(decrypt(&sealed, &key, &mac_key).unwrap(), message);
    }

    #[test]
    fn any_flipped_bit_fails_authentication(
        message in prop::collection::vec(any::<u8>(), 0..128),
        key in any::<[u8; 24]>(),
        mac_key in any::<[u8; 32]>(),
        target in 0usize..3,
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut sealed = encrypt(&message, &key, &mac_key).unwrap();
        let field: &mut [u8] = match target {
            0 => &mut sealed.ciphertext,
            1 => &mut sealed.iv,
            _ => &mut sealed.mac,
        };
        let i = position.index(field.len());
        field[i] ^= 1 << bit;

        prop_assert!(matches!(
            decrypt(&sealed, &key, &mac_key),
            Err(CryptoError::AuthenticationFailed)
        ));
    }
}
