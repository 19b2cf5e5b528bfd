//! RAD50 codec.
//!
//! ACNET task handles and node names are six characters drawn from a
//! 40-character alphabet, packed three to a 16-bit word and two words to a
//! `u32`. The daemon treats the packed value as opaque; this module only
//! exists so logs and synthesized names are readable.

const ALPHABET: &[u8; 40] = b" ABCDEFGHIJKLMNOPQRSTUVWXYZ$.%0123456789";

fn char_index(c: u8) -> u16 {
    match c {
        b'A'..=b'Z' => (c - b'A') as u16 + 1,
        b'a'..=b'z' => (c - b'a') as u16 + 1,
        b'0'..=b'9' => (c - b'0') as u16 + 30,
        b'$' => 27,
        b'.' => 28,
        b'%' => 29,
        _ => 0,
    }
}

fn pack_word(chars: &[u8]) -> u16 {
    chars
        .iter()
        .fold(0u16, |acc, &c| acc * 40 + char_index(c))
}

/// Pack up to six characters into a RAD50 `u32`. Shorter names are padded
/// with blanks; characters outside the alphabet become blanks.
pub fn pack(name: &str) -> u32 {
    let mut buf = [b' '; 6];

    for (slot, c) in buf.iter_mut().zip(name.bytes()) {
        *slot = c;
    }

    pack_word(&buf[..3]) as u32 | (pack_word(&buf[3..]) as u32) << 16
}

fn unpack_word(mut word: u16, out: &mut Vec<u8>) {
    let mut chars = [0u8; 3];

    for slot in chars.iter_mut().rev() {
        *slot = ALPHABET[(word % 40) as usize];
        word /= 40;
    }
    out.extend_from_slice(&chars);
}

/// Unpack a RAD50 `u32` into its textual form with trailing blanks removed.
pub fn unpack(value: u32) -> String {
    let mut out = Vec::with_capacity(6);

    unpack_word(value as u16, &mut out);
    unpack_word((value >> 16) as u16, &mut out);

    while out.last() == Some(&b' ') {
        out.pop();
    }
    String::from_utf8_lossy(&out).into_owned()
}
