use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use thiserror::Error;

pub const CREDENTIALS_FILE_NAME: &str = "p2p_credentials.env";
pub const API_KEY_VAR: &str = "API_KEY";
pub const APP_ID_VAR: &str = "APP_ID";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credentials file {path} could not be read: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("credentials file {0} has no API_KEY")]
    MissingApiKey(PathBuf),
    #[error("credentials io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to determine home directory")]
    NoHomeDir,
}

/// API key plus the app id the relay last assigned, persisted as
/// `KEY="value"` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub app_id: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            app_id: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        let parse_error = |source| CredentialsError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let mut api_key = None;
        let mut app_id = None;
        for item in dotenvy::from_path_iter(path).map_err(parse_error)? {
            let (key, value) = item.map_err(parse_error)?;
            match key.as_str() {
                API_KEY_VAR => api_key = Some(value),
                APP_ID_VAR => app_id = Some(value),
                _ => {}
            }
        }
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| CredentialsError::MissingApiKey(path.to_path_buf()))?;
        Ok(Self {
            api_key,
            app_id: app_id.filter(|id| !id.is_empty()),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), CredentialsError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut contents = format!("{API_KEY_VAR}={}\n", quote(&self.api_key));
        if let Some(app_id) = &self.app_id {
            contents.push_str(&format!("{APP_ID_VAR}={}\n", quote(app_id)));
        }

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if matches!(ch, '\\' | '"' | '$') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// `~/.peerlink/p2p_credentials.env`
pub fn user_credentials_path() -> Result<PathBuf, CredentialsError> {
    let base = BaseDirs::new().ok_or(CredentialsError::NoHomeDir)?;
    Ok(base.home_dir().join(".peerlink").join(CREDENTIALS_FILE_NAME))
}

/// Lookup order: the explicit path, the file next to the executable, then the
/// per-user location.
pub fn candidate_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(path) = explicit {
        paths.push(path.to_path_buf());
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        paths.push(dir.join(CREDENTIALS_FILE_NAME));
    }
    if let Ok(path) = user_credentials_path() {
        paths.push(path);
    }
    paths
}

/// First readable credentials file in [`candidate_paths`] order. Files that
/// exist but fail to parse are logged and skipped.
pub fn resolve(explicit: Option<&Path>) -> Option<(PathBuf, Credentials)> {
    for path in candidate_paths(explicit) {
        if !path.is_file() {
            continue;
        }
        match Credentials::load(&path) {
            Ok(credentials) => return Some((path, credentials)),
            Err(err) => {
                tracing::warn!(
                    target = "peerlink::credentials",
                    path = %path.display(),
                    error = %err,
                    "ignoring unreadable credentials file"
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CREDENTIALS_FILE_NAME);
        let credentials = Credentials {
            api_key: "sk_live \"quoted\" $HOME".into(),
            app_id: Some("app-42".into()),
        };
        credentials.save(&path).unwrap();
        assert_eq!(Credentials::load(&path).unwrap(), credentials);
    }

    #[test]
    fn plain_dotenv_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE_NAME);
        fs::write(&path, "# issued by the dashboard\nAPI_KEY=abc123\nOTHER=1\n").unwrap();
        let credentials = Credentials::load(&path).unwrap();
        assert_eq!(credentials.api_key, "abc123");
        assert_eq!(credentials.app_id, None);
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE_NAME);
        fs::write(&path, "APP_ID=app-1\n").unwrap();
        assert!(matches!(
            Credentials::load(&path),
            Err(CredentialsError::MissingApiKey(_))
        ));
    }

    #[test]
    fn explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.env");
        Credentials::new("explicit").save(&path).unwrap();

        let paths = candidate_paths(Some(&path));
        assert_eq!(paths[0], path);
        let (found, credentials) = resolve(Some(&path)).unwrap();
        assert_eq!(found, path);
        assert_eq!(credentials.api_key, "explicit");
    }
}
