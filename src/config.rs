//! Option table and its resolved, typed view.
//!
//! `Config` is what an embedder fills in: a flat name → value table
//! pre-populated with defaults. `Server::start` resolves it exactly once into
//! [`Settings`], which is what the rest of the server reads.

use std::fs;
use std::path::{Path, PathBuf};

use crate::acl::AccessControlList;
use crate::error::{Result, ServerError};
use crate::http::mime::MimeTypes;
use crate::http::uri::DocumentRoots;
use crate::listener::ListenerSpec;

/// Every recognised option with its default value.
const OPTIONS: &[(&str, &str)] = &[
    ("listening_ports", "8080"),
    ("document_root", "."),
    ("index_files", "index.html,index.htm,index.cgi,index.shtml"),
    ("cgi_extensions", ".cgi,.pl"),
    ("ssi_extensions", ".shtml,.shtm"),
    ("cgi_interpreter", ""),
    ("cgi_environment", ""),
    ("global_passwords_file", ""),
    ("put_delete_passwords_file", ""),
    ("protect", ""),
    ("authentication_domain", "mydomain.com"),
    ("access_log_file", ""),
    ("error_log_file", ""),
    ("enable_directory_listing", "yes"),
    ("enable_keep_alive", "yes"),
    ("max_request_size", "16384"),
    ("extra_mime_types", ""),
    ("ssl_certificate", ""),
    ("ssl_chain_file", ""),
    ("num_threads", "10"),
    ("run_as_user", ""),
    ("access_control_list", ""),
];

/// Smallest per-worker request buffer we accept.
const MIN_REQUEST_SIZE: usize = 256;

/// Name → value option table.
#[derive(Debug, Clone)]
pub struct Config {
    values: Vec<(&'static str, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Table holding every option at its default.
    pub fn new() -> Self {
        Self {
            values: OPTIONS
                .iter()
                .map(|&(name, default)| (name, default.to_string()))
                .collect(),
        }
    }

    /// All option names with their defaults, in table order.
    pub fn options() -> impl Iterator<Item = (&'static str, &'static str)> {
        OPTIONS.iter().copied()
    }

    /// Set one option. Unknown names are rejected.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let slot = self
            .values
            .iter_mut()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| ServerError::UnknownOption(name.to_string()))?;
        slot.1 = value.into();
        Ok(())
    }

    /// Chaining form of [`Config::set`].
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Current value of an option, `None` for unknown names.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Read `name value` lines from a file on top of the defaults.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ServerError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, value) = match line.split_once(char::is_whitespace) {
                Some((name, value)) => (name, value.trim()),
                None => (line, ""),
            };
            config.set(name, value)?;
        }
        Ok(config)
    }

    fn value(&self, name: &'static str) -> &str {
        self.get(name).unwrap_or_default()
    }

    fn path(&self, name: &'static str) -> Option<PathBuf> {
        let v = self.value(name);
        (!v.is_empty()).then(|| PathBuf::from(v))
    }

    fn flag(&self, name: &'static str) -> Result<bool> {
        let v = self.value(name);
        match v.to_ascii_lowercase().as_str() {
            "yes" | "true" | "1" | "on" => Ok(true),
            "no" | "false" | "0" | "off" => Ok(false),
            _ => Err(ServerError::invalid(name, v, "expected yes or no")),
        }
    }

    fn number(&self, name: &'static str) -> Result<usize> {
        let v = self.value(name);
        v.trim()
            .parse()
            .map_err(|_| ServerError::invalid(name, v, "not a number"))
    }

    /// Resolve the table into typed settings.
    pub(crate) fn resolve(&self) -> Result<Settings> {
        let listeners = split_list(self.value("listening_ports"))
            .map(|spec| {
                ListenerSpec::parse(spec)
                    .map_err(|reason| ServerError::invalid("listening_ports", spec, reason))
            })
            .collect::<Result<Vec<_>>>()?;
        if listeners.is_empty() {
            return Err(ServerError::invalid("listening_ports", "", "no ports given"));
        }

        let roots = DocumentRoots::parse(self.value("document_root"))
            .map_err(|reason| ServerError::invalid("document_root", self.value("document_root"), reason))?;

        let num_threads = self.number("num_threads")?;
        if num_threads == 0 {
            return Err(ServerError::invalid("num_threads", "0", "need at least one worker"));
        }

        let max_request_size = self.number("max_request_size")?;
        if max_request_size < MIN_REQUEST_SIZE {
            return Err(ServerError::invalid(
                "max_request_size",
                self.value("max_request_size"),
                format!("must be at least {MIN_REQUEST_SIZE}"),
            ));
        }

        let cgi_environment = split_pairs("cgi_environment", self.value("cgi_environment"))?;
        let protect = split_pairs("protect", self.value("protect"))?
            .into_iter()
            .map(|(uri, file)| (uri, PathBuf::from(file)))
            .collect();

        let mime = MimeTypes::with_overrides(&split_pairs(
            "extra_mime_types",
            self.value("extra_mime_types"),
        )?);

        let acl_value = self.value("access_control_list");
        let acl = AccessControlList::parse(acl_value)
            .map_err(|reason| ServerError::invalid("access_control_list", acl_value, reason))?;

        let run_as_user = self.value("run_as_user");

        Ok(Settings {
            listeners,
            roots,
            index_files: owned_list(self.value("index_files")),
            cgi_extensions: owned_list(self.value("cgi_extensions")),
            ssi_extensions: owned_list(self.value("ssi_extensions")),
            cgi_interpreter: self.path("cgi_interpreter"),
            cgi_environment,
            global_passwords_file: self.path("global_passwords_file"),
            put_delete_passwords_file: self.path("put_delete_passwords_file"),
            protect,
            auth_domain: self.value("authentication_domain").to_string(),
            access_log_file: self.path("access_log_file"),
            error_log_file: self.path("error_log_file"),
            directory_listing: self.flag("enable_directory_listing")?,
            keep_alive: self.flag("enable_keep_alive")?,
            max_request_size,
            mime,
            ssl_certificate: self.path("ssl_certificate"),
            ssl_chain_file: self.path("ssl_chain_file"),
            num_threads,
            run_as_user: (!run_as_user.is_empty()).then(|| run_as_user.to_string()),
            acl,
        })
    }
}

/// Typed view of a [`Config`], fixed for the lifetime of a running server.
#[derive(Debug)]
pub(crate) struct Settings {
    pub listeners: Vec<ListenerSpec>,
    pub roots: DocumentRoots,
    pub index_files: Vec<String>,
    pub cgi_extensions: Vec<String>,
    pub ssi_extensions: Vec<String>,
    pub cgi_interpreter: Option<PathBuf>,
    pub cgi_environment: Vec<(String, String)>,
    pub global_passwords_file: Option<PathBuf>,
    pub put_delete_passwords_file: Option<PathBuf>,
    pub protect: Vec<(String, PathBuf)>,
    pub auth_domain: String,
    pub access_log_file: Option<PathBuf>,
    pub error_log_file: Option<PathBuf>,
    pub directory_listing: bool,
    pub keep_alive: bool,
    pub max_request_size: usize,
    pub mime: MimeTypes,
    pub ssl_certificate: Option<PathBuf>,
    pub ssl_chain_file: Option<PathBuf>,
    pub num_threads: usize,
    pub run_as_user: Option<String>,
    pub acl: AccessControlList,
}

/// Comma separated list with blanks dropped.
pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn owned_list(value: &str) -> Vec<String> {
    split_list(value).map(str::to_string).collect()
}

fn split_pairs(name: &'static str, value: &str) -> Result<Vec<(String, String)>> {
    split_list(value)
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| ServerError::invalid(name, item, "expected name=value"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_present() {
        let config = Config::new();
        assert_eq!(config.get("listening_ports"), Some("8080"));
        assert_eq!(config.get("num_threads"), Some("10"));
        assert_eq!(config.get("no_such_option"), None);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let mut config = Config::new();
        let err = config.set("bogus", "1").unwrap_err();
        assert!(matches!(err, ServerError::UnknownOption(name) if name == "bogus"));
    }

    #[test]
    fn resolve_parses_typed_values() {
        let settings = Config::new()
            .with("listening_ports", "127.0.0.1:0,0p")
            .unwrap()
            .with("cgi_environment", "A=1, B = two")
            .unwrap()
            .with("enable_keep_alive", "no")
            .unwrap()
            .resolve()
            .unwrap();
        assert_eq!(settings.listeners.len(), 2);
        assert!(settings.listeners[1].proxy);
        assert_eq!(
            settings.cgi_environment,
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "two".to_string())]
        );
        assert!(!settings.keep_alive);
        assert_eq!(settings.cgi_extensions, vec![".cgi", ".pl"]);
    }

    #[test]
    fn bad_flag_and_number_are_errors() {
        let config = Config::new().with("enable_directory_listing", "maybe").unwrap();
        assert!(config.resolve().is_err());
        let config = Config::new().with("num_threads", "0").unwrap();
        assert!(config.resolve().is_err());
        let config = Config::new().with("max_request_size", "12").unwrap();
        assert!(config.resolve().is_err());
    }

    #[test]
    fn from_file_reads_name_value_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "num_threads 3").unwrap();
        writeln!(file, "document_root   /srv/www").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.get("num_threads"), Some("3"));
        assert_eq!(config.get("document_root"), Some("/srv/www"));
    }
}
