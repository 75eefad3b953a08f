use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Generate a fresh random 256-bit salt for a new encrypted room.
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Derive the room key via HKDF-SHA256 (RFC 5869, single output block):
/// extract with the room salt, expand with the room id as the info string.
/// Deterministic — identical (secret, salt, room) always yields the same
/// key, which is what makes key-cache eviction safe.
pub fn derive_room_key(secret: &[u8], salt: &[u8], room_id: &Uuid) -> [u8; 32] {
    // Extract: PRK = HMAC(salt, secret)
    let mut extract =
        HmacSha256::new_from_slice(salt).expect("hmac accepts any key length");
    extract.update(secret);
    let prk = extract.finalize().into_bytes();

    // Expand: OKM = HMAC(PRK, info || 0x01), one 32-byte block
    let mut expand =
        HmacSha256::new_from_slice(&prk).expect("hmac accepts any key length");
    expand.update(room_id.as_bytes());
    expand.update(&[0x01]);
    expand.finalize().into_bytes().into()
}
