use {
    crate::writer::Tee,
    derive_more::Display,
    serde_derive::Deserialize,
    std::{fs, io, path::Path, path::PathBuf},
};

pub static CONFIG_PATH: &str = "files/config.toml"; // Read when --config is not given, optional
pub static HOST: &str = "127.0.0.1"; // Interface to bind
pub static PORT: u16 = 50801; // TCP port to attach to
pub static PASSWORD_FILE: &str = "password"; // Hex SHA-512 of the admin key
pub static REQUEST_LOG: &str = "files/logs/requests.log"; // Active request log, archives get .1, .2, ...
pub static MAX_BYTES: u64 = 3_000_000; // Rotate before the active request log would exceed this
pub static BACKUP_COUNT: usize = 3; // Number of rotated request logs to keep
pub static LOGLEVEL: u8 = 128; // Log level of the standard logger
pub static LOGLEVEL_IMPORTANT: u8 = 255; // Log level of the important logger (trace = 255, debug = 192,
                                         // info = 128, warn = 64, error = 0)

// ---

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub log_level: u8,
    pub password_file: PathBuf,
    pub request_log: RotationConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: HOST.into(),
            port: PORT,
            log_level: LOGLEVEL,
            password_file: PASSWORD_FILE.into(),
            request_log: RotationConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RotationConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub backup_count: usize,
    pub tee: Tee,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            path: REQUEST_LOG.into(),
            max_bytes: MAX_BYTES,
            backup_count: BACKUP_COUNT,
            tee: Tee::Stdout,
        }
    }
}

#[derive(Debug, Display)]
pub enum ConfigError {
    #[display(fmt = "unable to read {:?}: {}", _0, _1)]
    Read(PathBuf, io::Error),
    #[display(fmt = "unable to parse settings: {}", _0)]
    Parse(toml::de::Error),
    #[display(fmt = "invalid settings: {}", _0)]
    Invalid(&'static str),
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read(_, err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl Settings {
    /// Reads settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Read(path.to_path_buf(), err)),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(contents).map_err(ConfigError::Parse)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_log.max_bytes == 0 {
            return Err(ConfigError::Invalid("request_log.max_bytes must be positive"));
        }
        if self.request_log.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("request_log.path must not be empty"));
        }
        Ok(())
    }
}
