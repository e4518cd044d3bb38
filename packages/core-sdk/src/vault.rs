use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/** \brief PBKDF2 迭代次数，刻意放慢以抬高暴力破解成本。 */
pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

/**
 * \brief 口令派生出的对称密钥。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/**
 * \brief 加密后的密钥。三个字段均为十六进制文本，缺一不可。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /** \brief PBKDF2 盐。 */
    #[serde(default)]
    pub salt: String,
    /** \brief AES-GCM 随机数。 */
    #[serde(default)]
    pub nonce: String,
    /** \brief 密文（末尾附带认证标签）。 */
    #[serde(default)]
    pub ciphertext: String,
}

/**
 * \brief 由口令和盐派生密钥（PBKDF2-HMAC-SHA256）。相同输入得到相同密钥。
 */
pub fn derive_key(password: &str, salt: &[u8]) -> DerivedKey {
    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations(),
        salt,
        password.as_bytes(),
        &mut out,
    );
    DerivedKey(out)
}

/**
 * \brief 以口令加密明文。每次调用都会生成新的盐与随机数。
 */
pub fn encrypt(password: &str, plaintext: &str) -> Result<EncryptedSecret, VaultError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| VaultError::Random)?;
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce).map_err(|_| VaultError::Random)?;

    let key = sealing_key(&derive_key(password, &salt))?;
    let mut in_out = plaintext.as_bytes().to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::Random)?;

    Ok(EncryptedSecret {
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(in_out),
    })
}

/**
 * \brief 以口令解密。认证标签不通过或任一字段缺失/格式错误时返回 `VaultError::Decryption`。
 */
pub fn decrypt(password: &str, secret: &EncryptedSecret) -> Result<String, VaultError> {
    let salt = decode_field(&secret.salt, "salt")?;
    if salt.len() != SALT_LEN {
        return Err(VaultError::Decryption("salt has wrong length"));
    }
    let nonce: [u8; NONCE_LEN] = decode_field(&secret.nonce, "nonce")?
        .try_into()
        .map_err(|_| VaultError::Decryption("nonce has wrong length"))?;
    let mut in_out = decode_field(&secret.ciphertext, "ciphertext")?;
    if in_out.len() < TAG_LEN {
        return Err(VaultError::Decryption("ciphertext is truncated"));
    }

    let key = sealing_key(&derive_key(password, &salt))?;
    let plain = key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::Decryption("authentication tag mismatch"))?;
    String::from_utf8(plain.to_vec()).map_err(|_| VaultError::Decryption("plaintext is not utf-8"))
}

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

fn sealing_key(key: &DerivedKey) -> Result<LessSafeKey, VaultError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key.as_bytes())
        .map_err(|_| VaultError::Decryption("invalid key material"))?;
    Ok(LessSafeKey::new(unbound))
}

fn decode_field(value: &str, field: &'static str) -> Result<Vec<u8>, VaultError> {
    if value.is_empty() {
        return Err(VaultError::Decryption(match field {
            "salt" => "salt is missing",
            "nonce" => "nonce is missing",
            _ => "ciphertext is missing",
        }));
    }
    hex::decode(value).map_err(|_| VaultError::Decryption("field is not valid hex"))
}
