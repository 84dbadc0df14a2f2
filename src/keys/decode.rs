// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

//! Recognizes the private key containers users are likely to have lying
//! around and turns them into agent keys.

use aes::cipher::{BlockDecryptMut, KeyIvInit};
use block_padding::Pkcs7;
use md5::{Digest, Md5};
use pkcs8::{
    der::{asn1::OctetStringRef, Decode},
    EncryptedPrivateKeyInfo, ObjectIdentifier, PrivateKeyInfo,
};
use rsa::{pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey};
use secrecy::{ExposeSecret, SecretString};
use ssh_key::{
    private::{EcdsaKeypair, Ed25519Keypair, KeypairData, RsaKeypair},
    PrivateKey,
};

use crate::error::{self, Result};

const OPENSSH_LABEL: &str = "OPENSSH PRIVATE KEY";
const ENCRYPTED_PKCS8_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const PKCS8_LABEL: &str = "PRIVATE KEY";
const RSA_LABEL: &str = "RSA PRIVATE KEY";
const EC_LABEL: &str = "EC PRIVATE KEY";

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

fn decode_failed<E: ToString>(e: E) -> error::Error {
    error::Key::DecodeFailed(e.to_string()).into()
}

fn rejected<E: ToString>(e: E) -> error::Error {
    error::Key::ParseFailed(error::Parse::Rejected(e.to_string())).into()
}

fn incorrect_passphrase<E>(_: E) -> error::Error {
    error::Key::ParseFailed(error::Parse::IncorrectPassphrase).into()
}

struct Pem<'text> {
    label: &'text str,
    headers: Vec<(&'text str, &'text str)>,
    der: Vec<u8>,
}

impl<'text> Pem<'text> {
    fn parse(text: &'text str) -> Result<Self> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .skip_while(|line| !line.starts_with("-----BEGIN "));

        let label = lines
            .next()
            .and_then(|line| line.strip_prefix("-----BEGIN "))
            .and_then(|line| line.strip_suffix("-----"))
            .ok_or_else(|| decode_failed("no PEM block found"))?;
        let end = format!("-----END {label}-----");

        let mut headers = Vec::new();
        let mut body = String::new();
        let mut closed = false;
        for line in lines {
            if line == end {
                closed = true;
                break;
            }

            match line.split_once(':') {
                Some((name, value)) if body.is_empty() => headers.push((name.trim(), value.trim())),
                _ => body.push_str(line),
            }
        }

        if !closed {
            return Err(decode_failed(format!("PEM block {label:?} is not terminated")));
        }

        Ok(Self {
            label,
            headers,
            der: base64::decode(&body).map_err(decode_failed)?,
        })
    }

    fn header(&self, name: &str) -> Option<&'text str> {
        self.headers
            .iter()
            .find(|&&(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|&(_, value)| value)
    }

    /// The `DEK-Info` of a block marked with `Proc-Type: 4,ENCRYPTED`.
    fn dek_info(&self) -> Option<&'text str> {
        let encrypted = self.header("Proc-Type").map_or(false, |value| {
            value.split(',').any(|part| part.trim() == "ENCRYPTED")
        });
        encrypted.then(|| self.header("DEK-Info").unwrap_or_default())
    }
}

/// Reports whether `pem` needs a passphrase before it can be loaded. Keys
/// that cannot be parsed at all are reported as unencrypted.
pub(crate) fn is_encrypted(pem: &str) -> bool {
    let Ok(block) = Pem::parse(pem) else {
        return false;
    };

    match block.label {
        ENCRYPTED_PKCS8_LABEL => true,
        // Nothing in the armor says whether an OpenSSH key is encrypted, so
        // look inside. This does not need the passphrase.
        OPENSSH_LABEL => PrivateKey::from_openssh(pem).map_or(false, |key| key.is_encrypted()),
        _ => block.dek_info().is_some(),
    }
}

/// Decodes and, if necessary, decrypts `pem`. The passphrase is ignored for
/// keys that are not encrypted.
pub(crate) fn decrypt(pem: &str, passphrase: &SecretString) -> Result<PrivateKey> {
    let block = Pem::parse(pem)?;
    let passphrase = passphrase.expose_secret().as_bytes();

    if block.label == ENCRYPTED_PKCS8_LABEL {
        let info = EncryptedPrivateKeyInfo::try_from(block.der.as_slice()).map_err(decode_failed)?;
        let document = info.decrypt(passphrase).map_err(incorrect_passphrase)?;
        // Garbage after a wrong passphrase can survive the padding check.
        return from_pkcs8(document.as_bytes()).map_err(incorrect_passphrase);
    }

    if let Some(dek_info) = block.dek_info() {
        if ![RSA_LABEL, EC_LABEL, PKCS8_LABEL].contains(&block.label) {
            return Err(decode_failed(format!("unsupported PEM block {:?}", block.label)));
        }
        let der = decrypt_legacy(&block, dek_info, passphrase)?;
        return from_der(block.label, &der).map_err(incorrect_passphrase);
    }

    if block.label == OPENSSH_LABEL {
        let key = PrivateKey::from_openssh(pem).map_err(decode_failed)?;
        if !key.is_encrypted() {
            return Ok(key);
        }
        return key.decrypt(passphrase).map_err(incorrect_passphrase);
    }

    from_der(block.label, &block.der)
}

fn from_der(label: &str, der: &[u8]) -> Result<PrivateKey> {
    match label {
        RSA_LABEL => from_rsa(rsa::RsaPrivateKey::from_pkcs1_der(der).map_err(rejected)?),
        EC_LABEL => from_p256(p256::SecretKey::from_sec1_der(der).map_err(rejected)?),
        PKCS8_LABEL => from_pkcs8(der),
        other => Err(decode_failed(format!("unsupported PEM block {other:?}"))),
    }
}

fn from_pkcs8(der: &[u8]) -> Result<PrivateKey> {
    let info = PrivateKeyInfo::try_from(der).map_err(rejected)?;
    let oid = info.algorithm.oid;
    if oid == RSA_ENCRYPTION {
        from_rsa(rsa::RsaPrivateKey::from_pkcs8_der(der).map_err(rejected)?)
    } else if oid == EC_PUBLIC_KEY {
        from_p256(p256::SecretKey::from_pkcs8_der(der).map_err(rejected)?)
    } else if oid == ED25519 {
        let seed: [u8; 32] = OctetStringRef::from_der(info.private_key)
            .map_err(rejected)?
            .as_bytes()
            .try_into()
            .map_err(|_| rejected("Ed25519 seed must be 32 bytes"))?;
        keypair(Ed25519Keypair::from_seed(&seed).into())
    } else {
        Err(rejected(format!("unsupported key algorithm {oid}")))
    }
}

fn from_rsa(key: rsa::RsaPrivateKey) -> Result<PrivateKey> {
    keypair(RsaKeypair::try_from(key).map_err(rejected)?.into())
}

fn from_p256(key: p256::SecretKey) -> Result<PrivateKey> {
    keypair(
        EcdsaKeypair::NistP256 {
            public: key.public_key().into(),
            private: key.into(),
        }
        .into(),
    )
}

fn keypair(data: KeypairData) -> Result<PrivateKey> {
    PrivateKey::new(data, "").map_err(rejected)
}

/// Reverses OpenSSL's traditional PEM encryption: a key derived from the
/// passphrase and the first eight bytes of the IV with a single round of
/// MD5, then AES-CBC.
fn decrypt_legacy(block: &Pem<'_>, dek_info: &str, passphrase: &[u8]) -> Result<Vec<u8>> {
    let (cipher, iv) = dek_info
        .split_once(',')
        .ok_or_else(|| decode_failed("DEK-Info header is malformed"))?;
    let iv = hex::decode(iv.trim()).map_err(|e| decode_failed(format!("DEK-Info IV: {e}")))?;
    let salt = iv
        .get(..8)
        .ok_or_else(|| decode_failed("DEK-Info IV is too short"))?;

    let plaintext = match cipher.trim() {
        "AES-128-CBC" => cbc::Decryptor::<aes::Aes128>::new_from_slices(&derive_legacy_key(passphrase, salt, 16), &iv)
            .map(|decryptor| decryptor.decrypt_padded_vec_mut::<Pkcs7>(&block.der)),
        "AES-192-CBC" => cbc::Decryptor::<aes::Aes192>::new_from_slices(&derive_legacy_key(passphrase, salt, 24), &iv)
            .map(|decryptor| decryptor.decrypt_padded_vec_mut::<Pkcs7>(&block.der)),
        "AES-256-CBC" => cbc::Decryptor::<aes::Aes256>::new_from_slices(&derive_legacy_key(passphrase, salt, 32), &iv)
            .map(|decryptor| decryptor.decrypt_padded_vec_mut::<Pkcs7>(&block.der)),
        other => return Err(decode_failed(format!("unsupported PEM cipher {other:?}"))),
    };

    plaintext.map_err(decode_failed)?.map_err(incorrect_passphrase)
}

fn derive_legacy_key(passphrase: &[u8], salt: &[u8], len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(len);
    let mut block = Vec::new();
    while key.len() < len {
        let mut hasher = Md5::new();
        hasher.update(&block);
        hasher.update(passphrase);
        hasher.update(salt);
        block = hasher.finalize().to_vec();
        key.extend_from_slice(&block);
    }
    key.truncate(len);
    key
}
