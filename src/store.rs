use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;

const USERS_FILE: &str = "users.json";
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("username is already taken")]
    UsernameTaken,
    #[error("email is already in use")]
    EmailTaken,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encoding(#[from] serde_json::Error),
}

/// One registered account. Emails are stored case-normalized, usernames
/// exactly as given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Account {
    pub(crate) username: String,
    pub(crate) email: String,
    pub(crate) password_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Session {
    username: String,
}

/// Derives the stored verifier for a password.
pub(crate) fn password_hash(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Flat JSON-file account storage: all accounts under one file, the
/// single current-session slot under another.
pub(crate) struct AccountStore {
    dir: PathBuf,
}

impl AccountStore {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        AccountStore { dir: dir.into() }
    }

    async fn load_users(&self) -> Result<Vec<Account>, StoreError> {
        match fs::read(self.dir.join(USERS_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_users(&self, users: &[Account]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.dir.join(USERS_FILE), serde_json::to_vec(users)?).await?;
        Ok(())
    }

    /// Registers an account; both the username and the email must be new.
    pub(crate) async fn create(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<Account, StoreError> {
        let mut users = self.load_users().await?;
        if users.iter().any(|u| u.username == username) {
            return Err(StoreError::UsernameTaken);
        }
        if users.iter().any(|u| u.email == email) {
            return Err(StoreError::EmailTaken);
        }
        let account = Account {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
        };
        users.push(account.clone());
        self.save_users(&users).await?;
        Ok(account)
    }

    pub(crate) async fn find(&self, username: &str) -> Result<Option<Account>, StoreError> {
        let users = self.load_users().await?;
        Ok(users.into_iter().find(|u| u.username == username))
    }

    /// True iff the account exists and the verifier matches.
    pub(crate) async fn verify(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .find(username)
            .await?
            .is_some_and(|u| u.password_hash == password_hash))
    }

    pub(crate) async fn set_session(&self, username: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let session = Session {
            username: username.to_string(),
        };
        fs::write(self.dir.join(SESSION_FILE), serde_json::to_vec(&session)?).await?;
        Ok(())
    }

    pub(crate) async fn session(&self) -> Result<Option<String>, StoreError> {
        match fs::read(self.dir.join(SESSION_FILE)).await {
            Ok(bytes) => {
                let session: Session = serde_json::from_slice(&bytes)?;
                Ok(Some(session.username))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn clear_session(&self) -> Result<(), StoreError> {
        match fs::remove_file(self.dir.join(SESSION_FILE)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
