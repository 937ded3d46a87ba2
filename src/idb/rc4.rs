//! The RC4 stream cipher, with the fixed key the Rockchip boot ROM uses to obfuscate IDB headers.

const RC4_KEY: [u8; 16] = [
    124, 78, 3, 4, 85, 5, 9, 7, 45, 44, 123, 56, 23, 13, 23, 17,
];

/// XOR `buf` with the keystream, in place. Applying this twice restores the original bytes.
pub fn rc4(buf: &mut [u8]) {
    let mut s: [u8; 256] = std::array::from_fn(|i| i as u8);

    let mut j = 0u8;
    for i in 0..256 {
        j = j.wrapping_add(s[i]).wrapping_add(RC4_KEY[i % RC4_KEY.len()]);
        s.swap(i, j as usize);
    }

    let (mut i, mut j) = (0u8, 0u8);
    for byte in buf.iter_mut() {
        i = i.wrapping_add(1);
        j = j.wrapping_add(s[i as usize]);
        s.swap(i as usize, j as usize);
        *byte ^= s[s[i as usize].wrapping_add(s[j as usize]) as usize];
    }
}

#[test]
fn test_keystream() {
    let mut buf = [0u8; 16];
    rc4(&mut buf);
    assert_eq!(
        buf,
        [
            0x6e, 0x26, 0x2c, 0xf3, 0xbe, 0x9f, 0x9d, 0x51, 0xea, 0x30, 0x34, 0xce, 0x20, 0x51,
            0x1f, 0x98
        ]
    );
}

#[test]
fn test_involution() {
    let original: Vec<u8> = (0..=255).cycle().take(512).collect();
    let mut buf = original.clone();
    rc4(&mut buf);
    assert_ne!(buf, original);
    rc4(&mut buf);
    assert_eq!(buf, original);
}
