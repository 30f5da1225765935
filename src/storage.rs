//! Device credential storage using the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Only the API token and
//! the provisioning identifiers live here; everything else is in the local
//! database.

use keyring::Entry;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::api::{parse_connection_string, ConnectionString};

const SERVICE_NAME: &str = "preventa-sync";

// Credential keys
const KEY_API_URL: &str = "api_url";
const KEY_API_TOKEN: &str = "api_token";
const KEY_VENDOR_ID: &str = "vendor_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_API_URL, KEY_API_TOKEN, KEY_VENDOR_ID];

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("keyring error for {key}: {source}")]
    Keyring {
        key: String,
        #[source]
        source: keyring::Error,
    },

    #[error("connection string is not valid or provisions nothing")]
    InvalidConnectionString,
}

fn keyring_error(key: &str) -> impl FnOnce(keyring::Error) -> CredentialError + '_ {
    move |source| CredentialError::Keyring {
        key: key.to_string(),
        source,
    }
}

fn entry(key: &str) -> Result<Entry, CredentialError> {
    Entry::new(SERVICE_NAME, key).map_err(keyring_error(key))
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist or the keyring cannot be read.
pub fn get_credential(key: &str) -> Option<Zeroizing<String>> {
    let entry = match entry(key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(Zeroizing::new(pw)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), CredentialError> {
    entry(key)?.set_password(value).map_err(keyring_error(key))
}

/// Delete a credential from the OS keyring. Succeeds if the entry does not
/// exist.
pub fn delete_credential(key: &str) -> Result<(), CredentialError> {
    match entry(key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(source) => Err(keyring_error(key)(source)),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

pub fn get_api_token() -> Option<Zeroizing<String>> {
    get_credential(KEY_API_TOKEN).filter(|token| !token.trim().is_empty())
}

pub fn get_api_url() -> Option<String> {
    get_credential(KEY_API_URL).map(|url| url.trim().to_string())
}

pub fn get_vendor_id() -> Option<String> {
    get_credential(KEY_VENDOR_ID).map(|vid| vid.trim().to_string())
}

/// Store what a decoded connection string provisions. Absent fields leave
/// the stored value untouched.
pub fn store_connection(connection: &ConnectionString) -> Result<(), CredentialError> {
    for (key, value) in credential_updates(connection) {
        set_credential(key, value)?;
    }
    info!(
        has_url = connection.url.is_some(),
        has_token = connection.key.is_some(),
        vendor_id = connection.vendor_id.as_deref().unwrap_or_default(),
        "device credentials updated"
    );
    Ok(())
}

/// Decode `raw` and store what it provisions. Nothing is written unless the
/// string decodes to at least one field.
pub fn provision(raw: &str) -> Result<ConnectionString, CredentialError> {
    let connection = provisioning_fields(raw)?;
    store_connection(&connection)?;
    Ok(connection)
}

fn provisioning_fields(raw: &str) -> Result<ConnectionString, CredentialError> {
    parse_connection_string(raw)
        .filter(|connection| !credential_updates(connection).is_empty())
        .ok_or(CredentialError::InvalidConnectionString)
}

fn credential_updates(connection: &ConnectionString) -> Vec<(&'static str, &str)> {
    [
        (KEY_API_URL, connection.url.as_deref()),
        (KEY_API_TOKEN, connection.key.as_deref()),
        (KEY_VENDOR_ID, connection.vendor_id.as_deref()),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.map(|v| (key, v)))
    .collect()
}

/// Delete every stored credential.
pub fn clear_credentials() -> Result<(), CredentialError> {
    info!("deleting all device credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_updates_skip_absent_fields() {
        let connection = ConnectionString {
            url: Some("https://ventas.example.com".into()),
            key: None,
            vendor_id: Some("V-07".into()),
        };
        let updates = credential_updates(&connection);
        assert_eq!(
            updates,
            vec![
                (KEY_API_URL, "https://ventas.example.com"),
                (KEY_VENDOR_ID, "V-07"),
            ]
        );
        assert!(credential_updates(&ConnectionString::default()).is_empty());
    }

    #[test]
    fn provisioning_rejects_strings_that_set_nothing() {
        assert!(matches!(
            provision("not a connection string"),
            Err(CredentialError::InvalidConnectionString)
        ));
        assert!(matches!(
            provision("{}"),
            Err(CredentialError::InvalidConnectionString)
        ));
        assert!(matches!(
            provision(r#"{"url":"  ","other":1}"#),
            Err(CredentialError::InvalidConnectionString)
        ));
    }

    #[test]
    fn provisioning_fields_are_normalized() {
        let connection =
            provisioning_fields(r#"{"apiUrl":"ventas.example.com/api/","vid":"V-07"}"#).unwrap();
        assert_eq!(connection.url.as_deref(), Some("https://ventas.example.com"));
        assert_eq!(connection.key, None);
        assert_eq!(connection.vendor_id.as_deref(), Some("V-07"));
    }
}
