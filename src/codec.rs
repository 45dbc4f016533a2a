//! Token-keyed encryption of RPC payloads.
//!
//! Every inter-node message is encoded with prost, encrypted with AES-256-CBC
//! and tagged with HMAC-SHA256 before it goes on the wire inside a
//! [SealedMessage]. Nobody without the token can read a payload, and a payload
//! opened with the wrong token is rejected before it reaches the protobuf decoder.

use std::fmt;

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::{
    error::CodecError,
    grpc::protos::{KeyKind, SealedMessage},
};

pub const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const TAG_LEN: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Turns a token of any length into a 32-byte key.
///
/// Tokens of 32 bytes or more are truncated. Shorter tokens are padded with
/// `32 - len` copies of the byte `32 - len`, so the padding can be stripped again.
pub fn derive_key(token: &str) -> [u8; KEY_LEN] {
    let bytes = token.as_bytes();
    let mut key = [0u8; KEY_LEN];
    if bytes.len() >= KEY_LEN {
        key.copy_from_slice(&bytes[..KEY_LEN]);
    } else {
        let pad = (KEY_LEN - bytes.len()) as u8;
        key[..bytes.len()].copy_from_slice(bytes);
        key[bytes.len()..].fill(pad);
    }
    key
}

/// AES-256-CBC with a token-derived key. The IV is the first 16 bytes of the key.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_LEN],
    mac_key: [u8; 32],
}

impl TokenCipher {
    pub fn new(token: &str) -> Self {
        let key = derive_key(token);
        let mac_key: [u8; 32] = Sha256::new()
            .chain_update(key)
            .chain_update(b"proxyfleet-mac")
            .finalize()
            .into();
        Self { key, mac_key }
    }

    /// Returns `ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let encryptor = Aes256CbcEnc::new_from_slices(&self.key, &self.key[..IV_LEN])
            .map_err(|e| CodecError::Cipher(e.to_string()))?;
        let mut sealed = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let tag = self.tag(&sealed)?;
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
        if sealed.len() < BLOCK_LEN + TAG_LEN {
            return Err(CodecError::Truncated);
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| CodecError::Cipher(e.to_string()))?;
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| CodecError::Integrity)?;

        let decryptor = Aes256CbcDec::new_from_slices(&self.key, &self.key[..IV_LEN])
            .map_err(|e| CodecError::Cipher(e.to_string()))?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CodecError::Padding)
    }

    fn tag(&self, ciphertext: &[u8]) -> Result<[u8; TAG_LEN], CodecError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| CodecError::Cipher(e.to_string()))?;
        mac.update(ciphertext);
        Ok(mac.finalize().into_bytes().into())
    }
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

/// Seals and opens protobuf messages with one token.
#[derive(Clone, Debug)]
pub struct MessageCodec {
    cipher: TokenCipher,
    key_kind: KeyKind,
}

impl MessageCodec {
    /// A codec keyed by the shared cluster token.
    pub fn cluster(token: &str) -> Self {
        Self {
            cipher: TokenCipher::new(token),
            key_kind: KeyKind::Cluster,
        }
    }

    /// A codec keyed by a token issued to one node.
    pub fn node(token: &str) -> Self {
        Self {
            cipher: TokenCipher::new(token),
            key_kind: KeyKind::Node,
        }
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn seal<M: prost::Message>(
        &self,
        cluster_name: &str,
        sender: &str,
        message: &M,
    ) -> Result<SealedMessage, CodecError> {
        Ok(SealedMessage {
            cluster_name: cluster_name.to_string(),
            sender: sender.to_string(),
            key_kind: self.key_kind as i32,
            payload: self.cipher.encrypt(&message.encode_to_vec())?,
        })
    }

    pub fn open<M: prost::Message + Default>(&self, sealed: &SealedMessage) -> Result<M, CodecError> {
        let plaintext = self.cipher.decrypt(&sealed.payload)?;
        Ok(M::decode(plaintext.as_slice())?)
    }
}

#[cfg(test)]
mod tests {
    use cbc::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};

    use super::{derive_key, Aes256CbcEnc, MessageCodec, TokenCipher, IV_LEN, KEY_LEN};
    use crate::{
        error::CodecError,
        grpc::protos::{KeyKind, NodeAuthInfo, NodeIdentity},
    };

    #[test]
    fn key_derivation_pads_and_truncates() {
        let short = derive_key("abc");
        assert_eq!(&short[..3], b"abc");
        assert!(short[3..].iter().all(|b| *b == 29));

        assert_eq!(derive_key(""), [32u8; KEY_LEN]);

        let long = "0123456789abcdef0123456789abcdef-and-more";
        assert_eq!(&derive_key(long), &long.as_bytes()[..KEY_LEN]);
    }

    #[quickcheck]
    fn round_trip_for_any_token_and_payload(token: String, payload: Vec<u8>) -> bool {
        let cipher = TokenCipher::new(&token);
        let sealed = cipher.encrypt(&payload).unwrap();
        cipher.decrypt(&sealed).unwrap() == payload
    }

    #[quickcheck]
    fn other_token_never_opens_payload(a: String, b: String, payload: Vec<u8>) -> bool {
        if derive_key(&a) == derive_key(&b) {
            return true;
        }
        let sealed = TokenCipher::new(&a).encrypt(&payload).unwrap();
        TokenCipher::new(&b).decrypt(&sealed).is_err()
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let cipher = TokenCipher::new("cluster-secret");
        let mut sealed = cipher.encrypt(b"hello").unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(cipher.decrypt(&sealed), Err(CodecError::Integrity)));
        assert!(matches!(cipher.decrypt(&sealed[..10]), Err(CodecError::Truncated)));
    }

    #[test]
    fn structurally_invalid_padding_is_rejected() {
        let cipher = TokenCipher::new("cluster-secret");
        // one block whose last byte claims 32 bytes of padding
        let block = [0x20u8; 16];
        let mut ciphertext = Aes256CbcEnc::new_from_slices(&cipher.key, &cipher.key[..IV_LEN])
            .unwrap()
            .encrypt_padded_vec_mut::<NoPadding>(&block);
        let tag = cipher.tag(&ciphertext).unwrap();
        ciphertext.extend_from_slice(&tag);

        assert!(matches!(cipher.decrypt(&ciphertext), Err(CodecError::Padding)));
    }

    #[test]
    fn message_round_trip() {
        let codec = MessageCodec::node("issued-token");
        let auth = NodeAuthInfo {
            token: "issued-token".to_string(),
            node: Some(NodeIdentity {
                host: "10.0.0.1".to_string(),
                port: 5000,
                cluster_name: "prod".to_string(),
                name: "edge-1".to_string(),
            }),
        };
        let sealed = codec.seal("prod", "edge-1", &auth).unwrap();
        assert_eq!(sealed.key_kind(), KeyKind::Node);
        assert_eq!(sealed.sender, "edge-1");

        let opened: NodeAuthInfo = codec.open(&sealed).unwrap();
        assert_eq!(opened, auth);
        assert!(MessageCodec::node("other-token")
            .open::<NodeAuthInfo>(&sealed)
            .is_err());
    }
}
