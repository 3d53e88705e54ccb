//! DES and DES-EDE3 block primitives (FIPS 46-3).
//!
//! Blocks and keys are big-endian `u64`s. Table entries are 1-based bit
//! positions counted from the most significant bit, exactly as printed in
//! the standard.

use zeroize::{Zeroize, ZeroizeOnDrop};

pub const BLOCK_LEN: usize = 8;
pub const TRIPLE_KEY_LEN: usize = 24;

const IP: [u8; 64] = [
    58, 50, 42, 34, 26, 18, 10, 2, 60, 52, 44, 36, 28, 20, 12, 4, //
    62, 54, 46, 38, 30, 22, 14, 6, 64, 56, 48, 40, 32, 24, 16, 8, //
    57, 49, 41, 33, 25, 17, 9, 1, 59, 51, 43, 35, 27, 19, 11, 3, //
    61, 53, 45, 37, 29, 21, 13, 5, 63, 55, 47, 39, 31, 23, 15, 7,
];

const FP: [u8; 64] = [
    40, 8, 48, 16, 56, 24, 64, 32, 39, 7, 47, 15, 55, 23, 63, 31, //
    38, 6, 46, 14, 54, 22, 62, 30, 37, 5, 45, 13, 53, 21, 61, 29, //
    36, 4, 44, 12, 52, 20, 60, 28, 35, 3, 43, 11, 51, 19, 59, 27, //
    34, 2, 42, 10, 50, 18, 58, 26, 33, 1, 41, 9, 49, 17, 57, 25,
];

const E: [u8; 48] = [
    32, 1, 2, 3, 4, 5, 4, 5, 6, 7, 8, 9, //
    8, 9, 10, 11, 12, 13, 12, 13, 14, 15, 16, 17, //
    16, 17, 18, 19, 20, 21, 20, 21, 22, 23, 24, 25, //
    24, 25, 26, 27, 28, 29, 28, 29, 30, 31, 32, 1,
];

const P: [u8; 32] = [
    16, 7, 20, 21, 29, 12, 28, 17, 1, 15, 23, 26, 5, 18, 31, 10, //
    2, 8, 24, 14, 32, 27, 3, 9, 19, 13, 30, 6, 22, 11, 4, 25,
];

const PC1: [u8; 56] = [
    57, 49, 41, 33, 25, 17, 9, 1, 58, 50, 42, 34, 26, 18, //
    10, 2, 59, 51, 43, 35, 27, 19, 11, 3, 60, 52, 44, 36, //
    63, 55, 47, 39, 31, 23, 15, 7, 62, 54, 46, 38, 30, 22, //
    14, 6, 61, 53, 45, 37, 29, 21, 13, 5, 28, 20, 12, 4,
];

const PC2: [u8; 48] = [
    14, 17, 11, 24, 1, 5, 3, 28, 15, 6, 21, 10, //
    23, 19, 12, 4, 26, 8, 16, 7, 27, 20, 13, 2, //
    41, 52, 31, 37, 47, 55, 30, 40, 51, 45, 33, 48, //
    44, 49, 39, 56, 34, 53, 46, 42, 50, 36, 29, 32,
];

/// Left-rotation applied to each 28-bit key half before each round.
const SHIFTS: [u32; 16] = [1, 1, 2, 2, 2, 2, 2, 2, 1, 2, 2, 2, 2, 2, 2, 1];

const SBOXES: [[u8; 64]; 8] = [
    [
        14, 4, 13, 1, 2, 15, 11, 8, 3, 10, 6, 12, 5, 9, 0, 7, //
        0, 15, 7, 4, 14, 2, 13, 1, 10, 6, 12, 11, 9, 5, 3, 8, //
        4, 1, 14, 8, 13, 6, 2, 11, 15, 12, 9, 7, 3, 10, 5, 0, //
        15, 12, 8, 2, 4, 9, 1, 7, 5, 11, 3, 14, 10, 0, 6, 13,
    ],
    [
        15, 1, 8, 14, 6, 11, 3, 4, 9, 7, 2, 13, 12, 0, 5, 10, //
        3, 13, 4, 7, 15, 2, 8, 14, 12, 0, 1, 10, 6, 9, 11, 5, //
        0, 14, 7, 11, 10, 4, 13, 1, 5, 8, 12, 6, 9, 3, 2, 15, //
        13, 8, 10, 1, 3, 15, 4, 2, 11, 6, 7, 12, 0, 5, 14, 9,
    ],
    [
        10, 0, 9, 14, 6, 3, 15, 5, 1, 13, 12, 7, 11, 4, 2, 8, //
        13, 7, 0, 9, 3, 4, 6, 10, 2, 8, 5, 14, 12, 11, 15, 1, //
        13, 6, 4, 9, 8, 15, 3, 0, 11, 1, 2, 12, 5, 10, 14, 7, //
        1, 10, 13, 0, 6, 9, 8, 7, 4, 15, 14, 3, 11, 5, 2, 12,
    ],
    [
        7, 13, 14, 3, 0, 6, 9, 10, 1, 2, 8, 5, 11, 12, 4, 15, //
        13, 8, 11, 5, 6, 15, 0, 3, 4, 7, 2, 12, 1, 10, 14, 9, //
        10, 6, 9, 0, 12, 11, 7, 13, 15, 1, 3, 14, 5, 2, 8, 4, //
        3, 15, 0, 6, 10, 1, 13, 8, 9, 4, 5, 11, 12, 7, 2, 14,
    ],
    [
        2, 12, 4, 1, 7, 10, 11, 6, 8, 5, 3, 15, 13, 0, 14, 9, //
        14, 11, 2, 12, 4, 7, 13, 1, 5, 0, 15, 10, 3, 9, 8, 6, //
        4, 2, 1, 11, 10, 13, 7, 8, 15, 9, 12, 5, 6, 3, 0, 14, //
        11, 8, 12, 7, 1, 14, 2, 13, 6, 15, 0, 9, 10, 4, 5, 3,
    ],
    [
        12, 1, 10, 15, 9, 2, 6, 8, 0, 13, 3, 4, 14, 7, 5, 11, //
        10, 15, 4, 2, 7, 12, 9, 5, 6, 1, 13, 14, 0, 11, 3, 8, //
        9, 14, 15, 5, 2, 8, 12, 3, 7, 0, 4, 10, 1, 13, 11, 6, //
        4, 3, 2, 12, 9, 5, 15, 10, 11, 14, 1, 7, 6, 0, 8, 13,
    ],
    [
        4, 11, 2, 14, 15, 0, 8, 13, 3, 12, 9, 7, 5, 10, 6, 1, //
        13, 0, 11, 7, 4, 9, 1, 10, 14, 3, 5, 12, 2, 15, 8, 6, //
        1, 4, 11, 13, 12, 3, 7, 14, 10, 15, 6, 8, 0, 5, 9, 2, //
        6, 11, 13, 8, 1, 4, 10, 7, 9, 5, 0, 15, 14, 2, 3, 12,
    ],
    [
        13, 2, 8, 4, 6, 15, 11, 1, 10, 9, 3, 14, 5, 0, 12, 7, //
        1, 15, 13, 8, 10, 3, 7, 4, 12, 5, 6, 11, 0, 14, 9, 2, //
        7, 11, 4, 1, 9, 12, 14, 2, 0, 6, 10, 13, 15, 3, 5, 8, //
        2, 1, 14, 7, 4, 10, 8, 13, 15, 12, 9, 0, 3, 5, 6, 11,
    ],
];

const HALF_MASK: u64 = (1 << 28) - 1;

/// Gather `table.len()` bits out of a `width`-bit value.
fn permute(input: u64, width: u32, table: &[u8]) -> u64 {
    table.iter().fold(0, |acc, &pos| {
        (acc << 1) | ((input >> (width - u32::from(pos))) & 1)
    })
}

fn feistel(right: u64, subkey: u64) -> u64 {
    let mixed = permute(right, 32, &E) ^ subkey;
    let substituted = SBOXES.iter().enumerate().fold(0u64, |acc, (i, sbox)| {
        let six = (mixed >> (42 - 6 * i)) & 0x3f;
        let row = ((six & 0x20) >> 4) | (six & 0x01);
        let col = (six >> 1) & 0x0f;
        #[allow(clippy::cast_possible_truncation)] // row < 4, col < 16
        let idx = (row * 16 + col) as usize;
        (acc << 4) | u64::from(sbox[idx])
    });
    permute(substituted, 32, &P)
}

/// Single-DES key schedule.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Des {
    subkeys: [u64; 16],
}

impl Des {
    /// Expand an 8-byte key. Parity bits (the low bit of each byte) are
    /// ignored by PC-1.
    pub fn new(key: &[u8; BLOCK_LEN]) -> Self {
        let cd = permute(u64::from_be_bytes(*key), 64, &PC1);
        let mut c = cd >> 28;
        let mut d = cd & HALF_MASK;
        let mut subkeys = [0u64; 16];
        for (subkey, &shift) in subkeys.iter_mut().zip(SHIFTS.iter()) {
            c = ((c << shift) | (c >> (28 - shift))) & HALF_MASK;
            d = ((d << shift) | (d >> (28 - shift))) & HALF_MASK;
            *subkey = permute((c << 28) | d, 56, &PC2);
        }
        Self { subkeys }
    }

    pub fn encrypt_block(&self, block: u64) -> u64 {
        crypt(block, self.subkeys.iter())
    }

    pub fn decrypt_block(&self, block: u64) -> u64 {
        crypt(block, self.subkeys.iter().rev())
    }
}

fn crypt<'a>(block: u64, subkeys: impl Iterator<Item = &'a u64>) -> u64 {
    let permuted = permute(block, 64, &IP);
    let (mut left, mut right) = (permuted >> 32, permuted & 0xffff_ffff);
    for &k in subkeys {
        let next = left ^ feistel(right, k);
        left = right;
        right = next;
    }
    // The last round's swap is undone before the final permutation.
    permute((right << 32) | left, 64, &FP)
}

/// DES-EDE3 with three independent keys carved from a 24-byte key:
/// `C = E_k3(D_k2(E_k1(P)))`, `P = D_k1(E_k2(D_k3(C)))`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TripleDes {
    k1: Des,
    k2: Des,
    k3: Des,
}

impl TripleDes {
    pub fn new(key: &[u8; TRIPLE_KEY_LEN]) -> Self {
        let part = |i: usize| {
            let mut k = [0u8; BLOCK_LEN];
            k.copy_from_slice(&key[i * BLOCK_LEN..(i + 1) * BLOCK_LEN]);
            let des = Des::new(&k);
            k.zeroize();
            des
        };
        Self {
            k1: part(0),
            k2: part(1),
            k3: part(2),
        }
    }

    pub fn encrypt_block(&self, block: u64) -> u64 {
        self.k3
            .encrypt_block(self.k2.decrypt_block(self.k1.encrypt_block(block)))
    }

    pub fn decrypt_block(&self, block: u64) -> u64 {
        self.k1
            .decrypt_block(self.k2.encrypt_block(self.k3.decrypt_block(block)))
    }
}
