use byteorder::{LittleEndian, WriteBytesExt};
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

pub const BOX_NONCE_SIZE: usize = libsodium_sys::crypto_box_NONCEBYTES as usize;
pub const BOX_MAC_SIZE: usize = libsodium_sys::crypto_box_MACBYTES as usize;
pub const BOX_PUBLIC_KEY_SIZE: usize = libsodium_sys::crypto_box_PUBLICKEYBYTES as usize;
pub const BOX_SECRET_KEY_SIZE: usize = libsodium_sys::crypto_box_SECRETKEYBYTES as usize;

pub const SIGNATURE_SIZE: usize = libsodium_sys::crypto_sign_BYTES as usize;
pub const SIGN_PUBLIC_KEY_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const SIGN_SECRET_KEY_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure. Idempotent.
pub fn init() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

#[inline]
fn nonce_to_bytes(nonce: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    (&mut nonce_bytes[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(nonce)
        .expect("Error creating nonce");
    nonce_bytes
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted
/// message size will be the plain text size plus the MAC size (16 bytes).
/// The function will fail if the cipher slice is not large enough.
///
/// The additional data, nonce and key must match those used during
/// decryption, the decryption will fail otherwise.
#[inline]
pub fn encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    let nonce_bytes = nonce_to_bytes(nonce);

    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded
/// message size is equal to the cipher text length minus the MAC (16 bytes).
/// The function will fail if the sizes do not match.
///
/// The additional data, nonce and key must match those used during
/// encryption, the decryption will fail otherwise.
#[inline]
pub fn decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    let nonce_bytes = nonce_to_bytes(nonce);

    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Seals the plain text to a recipient keypair, authenticated by the sender
/// keypair. The cipher slice must be exactly the plain length plus the box
/// MAC size (16 bytes). The nonce must be unique per sealed message.
#[inline]
pub fn box_seal(
    cipher: &mut [u8],
    plain: &[u8],
    nonce: &[u8; BOX_NONCE_SIZE],
    recipient_public_key: &[u8; BOX_PUBLIC_KEY_SIZE],
    sender_private_key: &[u8; BOX_SECRET_KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + BOX_MAC_SIZE {
        panic!(
            "Box seal: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            BOX_MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_box_easy(
            cipher.as_mut_ptr(),
            plain.as_ptr(),
            plain.len() as u64,
            nonce.as_ptr(),
            recipient_public_key.as_ptr(),
            sender_private_key.as_ptr(),
        );

        result >= 0
    }
}

/// Opens a sealed box addressed to the recipient keypair. The plain slice
/// must be exactly the cipher length minus the box MAC size.
#[inline]
pub fn box_open(
    plain: &mut [u8],
    cipher: &[u8],
    nonce: &[u8; BOX_NONCE_SIZE],
    sender_public_key: &[u8; BOX_PUBLIC_KEY_SIZE],
    recipient_private_key: &[u8; BOX_SECRET_KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + BOX_MAC_SIZE {
        panic!(
            "Box open: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            BOX_MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_box_open_easy(
            plain.as_mut_ptr(),
            cipher.as_ptr(),
            cipher.len() as u64,
            nonce.as_ptr(),
            sender_public_key.as_ptr(),
            recipient_private_key.as_ptr(),
        );

        result >= 0
    }
}

/// Generates a Curve25519 box keypair as (public, private).
#[inline]
pub fn generate_keypair() -> ([u8; BOX_PUBLIC_KEY_SIZE], [u8; BOX_SECRET_KEY_SIZE]) {
    let mut public_key = [0u8; BOX_PUBLIC_KEY_SIZE];
    let mut private_key = [0u8; BOX_SECRET_KEY_SIZE];

    unsafe {
        libsodium_sys::crypto_box_keypair(public_key.as_mut_ptr(), private_key.as_mut_ptr());
    }

    (public_key, private_key)
}

/// Generates an Ed25519 signing keypair as (public, private).
#[inline]
pub fn generate_sign_keypair() -> ([u8; SIGN_PUBLIC_KEY_SIZE], [u8; SIGN_SECRET_KEY_SIZE]) {
    let mut public_key = [0u8; SIGN_PUBLIC_KEY_SIZE];
    let mut private_key = [0u8; SIGN_SECRET_KEY_SIZE];

    unsafe {
        libsodium_sys::crypto_sign_keypair(public_key.as_mut_ptr(), private_key.as_mut_ptr());
    }

    (public_key, private_key)
}

/// Produces a detached Ed25519 signature over the message.
#[inline]
pub fn sign(message: &[u8], secret_key: &[u8; SIGN_SECRET_KEY_SIZE]) -> [u8; SIGNATURE_SIZE] {
    let mut signature = [0u8; SIGNATURE_SIZE];

    unsafe {
        libsodium_sys::crypto_sign_detached(
            signature.as_mut_ptr(),
            ::std::ptr::null_mut(),
            message.as_ptr(),
            message.len() as u64,
            secret_key.as_ptr(),
        );
    }

    signature
}

/// Verifies a detached Ed25519 signature over the message.
#[inline]
pub fn sign_verify(
    signature: &[u8; SIGNATURE_SIZE],
    message: &[u8],
    public_key: &[u8; SIGN_PUBLIC_KEY_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_sign_verify_detached(
            signature.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            public_key.as_ptr(),
        ) == 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Generates a random symmetric key.
#[inline]
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];

    random_bytes(&mut key);

    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        init();

        let key = random_key();
        let plain = [7u8; 100];
        let additional = [3u8; 10];

        let mut cipher = [0u8; 100 + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain, &additional, 42, &key));

        let mut decrypted = [0u8; 100];
        assert!(decrypt(&mut decrypted, &cipher, &additional, 42, &key));
        assert_eq!(&decrypted[..], &plain[..]);
    }

    #[test]
    fn test_decrypt_err_key_mismatch() {
        init();

        let key = random_key();
        let plain = [7u8; 64];
        let additional = [3u8; 10];

        let mut cipher = [0u8; 64 + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain, &additional, 42, &key));

        let other_key = random_key();
        let mut decrypted = [0u8; 64];
        assert!(!decrypt(&mut decrypted, &cipher, &additional, 42, &other_key));
    }

    #[test]
    fn test_decrypt_err_nonce_mismatch() {
        init();

        let key = random_key();
        let plain = [7u8; 64];
        let additional = [3u8; 10];

        let mut cipher = [0u8; 64 + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain, &additional, 42, &key));

        let mut decrypted = [0u8; 64];
        assert!(!decrypt(&mut decrypted, &cipher, &additional, 43, &key));
    }

    #[test]
    fn test_decrypt_err_additional_data_mismatch() {
        init();

        let key = random_key();
        let plain = [7u8; 64];

        let mut cipher = [0u8; 64 + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain, &[3u8; 10], 42, &key));

        let mut decrypted = [0u8; 64];
        assert!(!decrypt(&mut decrypted, &cipher, &[4u8; 10], 42, &key));
    }

    #[test]
    fn test_zero_tag_never_verifies() {
        init();

        let key = random_key();
        let additional = [3u8; 10];
        let cipher = [0u8; MAC_SIZE];

        assert!(!decrypt(&mut [], &cipher, &additional, 0, &key));
    }

    #[test]
    fn test_box_seal_open_roundtrip() {
        init();

        let (sender_public, sender_private) = generate_keypair();
        let (recipient_public, recipient_private) = generate_keypair();

        let mut nonce = [0u8; BOX_NONCE_SIZE];
        random_bytes(&mut nonce);

        let plain = [9u8; 71];
        let mut cipher = [0u8; 71 + BOX_MAC_SIZE];
        assert!(box_seal(&mut cipher, &plain, &nonce, &recipient_public, &sender_private));

        let mut opened = [0u8; 71];
        assert!(box_open(&mut opened, &cipher, &nonce, &sender_public, &recipient_private));
        assert_eq!(&opened[..], &plain[..]);
    }

    #[test]
    fn test_box_open_err_wrong_keypair() {
        init();

        let (_, sender_private) = generate_keypair();
        let (recipient_public, _) = generate_keypair();
        let (other_public, other_private) = generate_keypair();

        let mut nonce = [0u8; BOX_NONCE_SIZE];
        random_bytes(&mut nonce);

        let plain = [9u8; 18];
        let mut cipher = [0u8; 18 + BOX_MAC_SIZE];
        assert!(box_seal(&mut cipher, &plain, &nonce, &recipient_public, &sender_private));

        let mut opened = [0u8; 18];
        assert!(!box_open(&mut opened, &cipher, &nonce, &other_public, &other_private));
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        init();

        let (public_key, secret_key) = generate_sign_keypair();

        let message = b"route request body";
        let signature = sign(message, &secret_key);

        assert!(sign_verify(&signature, message, &public_key));
        assert!(!sign_verify(&signature, b"tampered body", &public_key));
    }
}
