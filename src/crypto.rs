use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn init_mac(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any size")
}

pub fn get_digest(secret: &[u8], val: &[u8]) -> Vec<u8> {
    let mut mac = init_mac(secret);
    mac.update(val);

    mac.finalize().into_bytes().to_vec()
}

pub fn is_valid(secret: &[u8], val: &[u8], digest: &[u8]) -> bool {
    let mut mac = init_mac(secret);
    mac.update(val);

    mac.verify_slice(digest).is_ok()
}
