use std::path::Path;

use rand::Rng;

use crate::dm::crypto::MessageCipher;

/// Load or generate the message encryption key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/message_key.
pub fn load_or_generate_message_key(data_dir: &str) -> Result<[u8; 32], std::io::Error> {
    let key_path = Path::new(data_dir).join("message_key");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if let Ok(key) = <[u8; 32]>::try_from(key.as_slice()) {
            tracing::info!("Message key loaded from {}", key_path.display());
            return Ok(key);
        }
        // A wrong-sized key would make every stored message unreadable
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "message key at {} has wrong size ({} bytes, expected 32)",
                key_path.display(),
                key.len()
            ),
        ));
    }

    std::fs::create_dir_all(data_dir)?;
    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("Message key generated at {}", key_path.display());
    Ok(key)
}

/// Build the at-rest cipher: a configured secret wins over the key file.
pub fn message_cipher(
    data_dir: &str,
    secret: Option<&str>,
) -> Result<MessageCipher, std::io::Error> {
    match secret.filter(|s| !s.is_empty()) {
        Some(secret) => {
            tracing::info!("Message key derived from configured secret");
            Ok(MessageCipher::from_secret(secret))
        }
        None => Ok(MessageCipher::new(&load_or_generate_message_key(data_dir)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();

        let first = load_or_generate_message_key(data_dir).unwrap();
        let second = load_or_generate_message_key(data_dir).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_wrong_sized_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("message_key"), b"short").unwrap();
        assert!(load_or_generate_message_key(dir.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_secret_takes_precedence_over_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();

        let blob = message_cipher(data_dir, Some("s3cret"))
            .unwrap()
            .encrypt("hello")
            .unwrap();
        assert!(!dir.path().join("message_key").exists());
        assert_eq!(
            MessageCipher::from_secret("s3cret").decrypt(&blob).unwrap(),
            "hello"
        );
    }
}
