use aes::Aes128;
use cbc::Decryptor;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, KeyIvInit};
use thiserror::Error;

type Aes128CbcDec = Decryptor<Aes128>;

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("segment is not a whole number of AES blocks or has bad padding")]
    Malformed,
    #[error("no IV available: playlist has neither IV attribute nor media sequence")]
    MissingIv,
}

/// AES-128-CBC cipher for one HLS track. Key bytes are fetched once and
/// cached here; the IV is either the playlist's explicit `IV=` value or
/// derived per segment from the media sequence number as the HLS spec
/// prescribes.
#[derive(Debug, Clone)]
pub struct SegmentCipher {
    key: [u8; 16],
    iv: Option<[u8; 16]>,
    media_sequence: Option<u64>,
}

impl SegmentCipher {
    pub fn new(key: [u8; 16], iv: Option<[u8; 16]>, media_sequence: Option<u64>) -> Self {
        Self {
            key,
            iv,
            media_sequence,
        }
    }

    pub fn has_explicit_iv(&self) -> bool {
        self.iv.is_some()
    }

    pub fn decrypt(&self, index: usize, data: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let iv = match self.iv {
            Some(iv) => iv,
            None => {
                let sequence = self.media_sequence.ok_or(DecryptError::MissingIv)?;
                sequence_iv(sequence + index as u64)
            }
        };
        let cipher = Aes128CbcDec::new(&self.key.into(), &iv.into());
        let mut buffer = data.to_vec();
        let decrypted = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|_| DecryptError::Malformed)?;
        let len = decrypted.len();
        buffer.truncate(len);
        Ok(buffer)
    }
}

/// Big-endian 128-bit IV carrying the media sequence number in the low
/// 64 bits.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::Encryptor;
    use cipher::BlockEncryptMut;

    type Aes128CbcEnc = Encryptor<Aes128>;

    fn encrypt(key: [u8; 16], iv: [u8; 16], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new(&key.into(), &iv.into());
        let mut buffer = plaintext.to_vec();
        let unpadded = buffer.len();
        buffer.resize(unpadded + 16, 0);
        let encrypted = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, unpadded)
            .unwrap();
        encrypted.to_vec()
    }

    #[test]
    fn explicit_iv_round_trip() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let plaintext = b"ts packet payload with some length to cross blocks";
        let encrypted = encrypt(key, iv, plaintext);

        let cipher = SegmentCipher::new(key, Some(iv), None);
        let decrypted = cipher.decrypt(0, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn derived_iv_uses_media_sequence_plus_index() {
        let key = [1u8; 16];
        let plaintext = b"segment three";
        let encrypted = encrypt(key, sequence_iv(12 + 3), plaintext);

        let cipher = SegmentCipher::new(key, None, Some(12));
        let decrypted = cipher.decrypt(3, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn missing_iv_sources_is_an_error() {
        let cipher = SegmentCipher::new([0u8; 16], None, None);
        assert!(matches!(
            cipher.decrypt(0, &[0u8; 16]),
            Err(DecryptError::MissingIv)
        ));
    }

    #[test]
    fn truncated_ciphertext_is_malformed() {
        let cipher = SegmentCipher::new([0u8; 16], Some([0u8; 16]), None);
        assert!(matches!(
            cipher.decrypt(0, &[1u8; 15]),
            Err(DecryptError::Malformed)
        ));
    }

    #[test]
    fn sequence_iv_is_big_endian() {
        let iv = sequence_iv(0x0102);
        assert_eq!(iv[14], 0x01);
        assert_eq!(iv[15], 0x02);
        assert!(iv[..14].iter().all(|b| *b == 0));
    }
}
