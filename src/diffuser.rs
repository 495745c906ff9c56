//! The Elephant diffuser used by the AES-CBC + diffuser methods.
//!
//! Both diffusers treat the sector as an array of little-endian 32-bit
//! words. Decryption runs the cycles in ascending word order and adds;
//! encryption runs them in descending order and subtracts, which undoes
//! each step in reverse.

use byteorder::{ByteOrder, LittleEndian};

const DIFFUSER_A_CYCLES: usize = 5;
const DIFFUSER_B_CYCLES: usize = 3;

const DIFFUSER_A_ROTATIONS: [u32; 4] = [9, 0, 13, 0];
const DIFFUSER_B_ROTATIONS: [u32; 4] = [0, 10, 0, 25];

fn load_words(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4).map(LittleEndian::read_u32).collect()
}

fn store_words(words: &[u32], data: &mut [u8]) {
    for (chunk, word) in data.chunks_exact_mut(4).zip(words) {
        LittleEndian::write_u32(chunk, *word);
    }
}

pub fn diffuser_a_decrypt(data: &mut [u8]) {
    let mut words = load_words(data);
    let n = words.len();
    for _ in 0..DIFFUSER_A_CYCLES {
        for i in 0..n {
            let mix = words[(i + n - 2) % n]
                ^ words[(i + n - 5) % n].rotate_left(DIFFUSER_A_ROTATIONS[i % 4]);
            words[i] = words[i].wrapping_add(mix);
        }
    }
    store_words(&words, data);
}

pub fn diffuser_a_encrypt(data: &mut [u8]) {
    let mut words = load_words(data);
    let n = words.len();
    for _ in 0..DIFFUSER_A_CYCLES {
        for i in (0..n).rev() {
            let mix = words[(i + n - 2) % n]
                ^ words[(i + n - 5) % n].rotate_left(DIFFUSER_A_ROTATIONS[i % 4]);
            words[i] = words[i].wrapping_sub(mix);
        }
    }
    store_words(&words, data);
}

pub fn diffuser_b_decrypt(data: &mut [u8]) {
    let mut words = load_words(data);
    let n = words.len();
    for _ in 0..DIFFUSER_B_CYCLES {
        for i in 0..n {
            let mix = words[(i + 2) % n]
                ^ words[(i + 5) % n].rotate_left(DIFFUSER_B_ROTATIONS[i % 4]);
            words[i] = words[i].wrapping_add(mix);
        }
    }
    store_words(&words, data);
}

pub fn diffuser_b_encrypt(data: &mut [u8]) {
    let mut words = load_words(data);
    let n = words.len();
    for _ in 0..DIFFUSER_B_CYCLES {
        for i in (0..n).rev() {
            let mix = words[(i + 2) % n]
                ^ words[(i + 5) % n].rotate_left(DIFFUSER_B_ROTATIONS[i % 4]);
            words[i] = words[i].wrapping_sub(mix);
        }
    }
    store_words(&words, data);
}
