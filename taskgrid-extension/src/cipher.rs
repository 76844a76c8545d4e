use aes_gcm_siv::{
  aead::{generic_array::GenericArray, Aead, AeadInPlace, OsRng, Payload},
  Aes256GcmSiv, Key, KeyInit,
};
use rand::RngCore;
use thiserror::Error;

type Cipher = Aes256GcmSiv;
pub type CipherKey = Key<Cipher>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
  #[error("encryption failure")]
  Encrypt,
  #[error("invalid key/nonce/value: bad seal")]
  Decrypt,
  #[error("input too short")]
  InputTooShort,
}

/// Encrypts a `Connector`/`EnvVariable` secret value.
///
/// `associated_data` is the owning row's id, which binds the ciphertext to that
/// specific row and prevents swapping encrypted values between rows.
pub fn encrypt(key: &CipherKey, associated_data: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError> {
  // [nonce | enc(payload) | tag]
  let mut buffer = vec![0; NONCE_LEN + data.len() + TAG_LEN];

  let (nonce, in_out) = buffer.split_at_mut(NONCE_LEN);
  let (in_out, tag) = in_out.split_at_mut(data.len());
  in_out.copy_from_slice(data);

  let mut rng = rand::rng();
  rng.fill_bytes(nonce);

  let cipher = Cipher::new(key);
  let aad_tag = cipher
    .encrypt_in_place_detached(&GenericArray::clone_from_slice(nonce), associated_data, in_out)
    .map_err(|_| CipherError::Encrypt)?;

  tag.copy_from_slice(&aad_tag);

  return Ok(buffer);
}

pub fn decrypt(key: &CipherKey, associated_data: &[u8], cipher_text: &[u8]) -> Result<Vec<u8>, CipherError> {
  if cipher_text.len() < NONCE_LEN + TAG_LEN {
    return Err(CipherError::InputTooShort);
  }

  let (nonce, msg) = cipher_text.split_at(NONCE_LEN);

  let cipher = Cipher::new(key);
  return cipher
    .decrypt(
      GenericArray::from_slice(nonce),
      Payload {
        msg,
        aad: associated_data,
      },
    )
    .map_err(|_| CipherError::Decrypt);
}

pub fn generate_random_key() -> CipherKey {
  return Cipher::generate_key(&mut OsRng);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_encryption() {
    let key = generate_random_key();
    let associated_data = b"connector-id";

    let payload = b"super-secret-token";
    let encrypted = encrypt(&key, associated_data, payload).unwrap();
    let decrypted = decrypt(&key, associated_data, &encrypted).unwrap();

    assert_eq!(payload, decrypted.as_slice());

    assert!(decrypt(&key, b"other-id", &encrypted).is_err());
  }
}
