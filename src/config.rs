//! Environment configuration.
//!
//! Secrets are never allowed a hard-coded default: if unset, they are
//! generated at boot with a `warn!` log naming which one.

use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub port: u16,
    pub admin_command_token: String,
    pub admin_api_key: String,
    pub feedback_ip_salt: String,
    pub chat_ip_salt: String,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            admin_command_token: env_or_generate("ADMIN_COMMAND_TOKEN"),
            admin_api_key: env_or_generate("ADMIN_API_KEY"),
            feedback_ip_salt: env_or_generate("FEEDBACK_IP_SALT"),
            chat_ip_salt: env_or_generate("CHAT_IP_SALT"),
        }
    }
}

fn env_or_generate(key: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => {
            let generated = random_secret();
            warn!(secret = key, "no value set for secret env var, generated an ephemeral one for this process");
            generated
        }
    }
}

fn random_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 24] = rng.gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_is_nonempty_hex() {
        let s = random_secret();
        assert_eq!(s.len(), 48);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn env_or_generate_prefers_existing_value() {
        unsafe {
            std::env::set_var("TEST_ONLY_SECRET_KEY", "explicit-value");
        }
        assert_eq!(env_or_generate("TEST_ONLY_SECRET_KEY"), "explicit-value");
        unsafe {
            std::env::remove_var("TEST_ONLY_SECRET_KEY");
        }
    }
}
