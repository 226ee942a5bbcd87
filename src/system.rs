//! Platform settings kept in the `config(key, value)` table.

use std::{
    net::IpAddr,
    str::FromStr,
    sync::{PoisonError, RwLock},
};

use sqlx::{types::ipnetwork::IpNetwork, PgPool, Row};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    accessor::{find_field, Entity, FieldDesc, Kind, Value},
    db::Param,
    error::{Error, Result},
    password::Rules,
    perms::Perm,
};

const SA: Perm = Perm::SYS_ADMIN;

static FIELDS: [FieldDesc; 27] = [
    FieldDesc::new("name", Kind::Str)
        .label("System Name")
        .hint("Name of the System")
        .set(SA),
    FieldDesc::new("welcome_text", Kind::Str)
        .label("Welcome Text")
        .hint("Welcome message shown on login page")
        .set(SA),
    FieldDesc::new("admin_name", Kind::Str)
        .label("Name of the Administrator(s)")
        .set(SA),
    FieldDesc::new("admin_email", Kind::Str)
        .label("Administrator email address")
        .set(SA),
    FieldDesc::new("admin_email_public", Kind::Bool)
        .label("Show Sysadmin E-mail to non-members")
        .set(SA),
    FieldDesc::new("copy_years", Kind::Str)
        .label("Copyright Years")
        .set(SA),
    FieldDesc::new("email_domain", Kind::Str)
        .label("Email Domain")
        .hint("The domain where emails are sourced from")
        .set(SA),
    FieldDesc::new("url_public", Kind::Str)
        .label("Public URL")
        .hint("The full URL where the system is exposed to the public")
        .set(SA),
    FieldDesc::new("people_domain", Kind::Str)
        .label("People Domain")
        .set(SA),
    FieldDesc::new("cli_enabled", Kind::Bool)
        .label("CLI Enabled")
        .hint("Offer the web command line to regular users")
        .set(SA),
    FieldDesc::new("api_enabled", Kind::Bool)
        .label("API Enabled")
        .hint("Enable the /api/ endpoint for authenticated tools")
        .set(SA),
    FieldDesc::new("oauth_enabled", Kind::Bool)
        .label("OAuth/OpenID Enabled")
        .set(SA),
    FieldDesc::new("no_index", Kind::Bool)
        .label("No Web Indexing")
        .set(SA),
    FieldDesc::new("email_sig", Kind::Str)
        .label("Email Signature")
        .set(SA),
    FieldDesc::new("require2fa", Kind::Bool)
        .label("Require 2FA")
        .hint("Require Two Factor Authentication for every login")
        .set(SA),
    FieldDesc::new("pw_enforce", Kind::Bool)
        .label("Enforce Rules")
        .hint("When enabled the password rules are enforced on new passwords")
        .set(SA),
    FieldDesc::new("pw_length", Kind::Int)
        .label("Minimal Password Length")
        .range(8, 1024)
        .set(SA),
    FieldDesc::new("pw_length_max", Kind::Int)
        .label("Maximal Password Length")
        .range(0, 65536)
        .set(SA),
    FieldDesc::new("pw_letters", Kind::Int)
        .label("Minimum amount of Letters")
        .range(0, 1024)
        .set(SA),
    FieldDesc::new("pw_uppers", Kind::Int)
        .label("Minimum amount of Uppercase characters")
        .range(0, 1024)
        .set(SA),
    FieldDesc::new("pw_lowers", Kind::Int)
        .label("Minimum amount of Lowercase characters")
        .range(0, 1024)
        .set(SA),
    FieldDesc::new("pw_numbers", Kind::Int)
        .label("Minimum amount of Numbers")
        .range(0, 1024)
        .set(SA),
    FieldDesc::new("pw_specials", Kind::Int)
        .label("Minimum amount of Special characters")
        .range(0, 1024)
        .set(SA),
    FieldDesc::new("sysadmin_restrict", Kind::List)
        .label("IP Restrict SysAdmin")
        .hint("CIDR prefixes from which the SysAdmin bit is honoured, loopback always is")
        .get(SA)
        .set(SA),
    FieldDesc::new("logo_image", Kind::Str)
        .label("Logo Image")
        .set(SA),
    FieldDesc::new("unknown_image", Kind::Str)
        .label("Unknown Person Image")
        .set(SA),
    FieldDesc::new("showversion", Kind::Bool)
        .label("Show version in UI")
        .set(SA),
];

/// Snapshot of the platform settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemConfig {
    pub name: String,
    pub welcome_text: String,
    pub admin_name: String,
    pub admin_email: String,
    pub admin_email_public: bool,
    pub copy_years: String,
    pub email_domain: String,
    pub url_public: String,
    pub people_domain: String,
    pub cli_enabled: bool,
    pub api_enabled: bool,
    pub oauth_enabled: bool,
    pub no_index: bool,
    pub email_sig: String,
    pub require2fa: bool,
    pub pw_enforce: bool,
    pub pw_length: i64,
    pub pw_length_max: i64,
    pub pw_letters: i64,
    pub pw_uppers: i64,
    pub pw_lowers: i64,
    pub pw_numbers: i64,
    pub pw_specials: i64,
    pub sysadmin_restrict: Vec<String>,
    pub logo_image: String,
    pub unknown_image: String,
    pub showversion: bool,
    pub(crate) sar: Vec<IpNetwork>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            welcome_text: String::new(),
            admin_name: String::new(),
            admin_email: String::new(),
            admin_email_public: false,
            copy_years: String::new(),
            email_domain: String::new(),
            url_public: String::new(),
            people_domain: String::new(),
            cli_enabled: false,
            api_enabled: true,
            oauth_enabled: true,
            no_index: true,
            email_sig: String::new(),
            require2fa: false,
            pw_enforce: false,
            pw_length: 12,
            pw_length_max: 1024,
            pw_letters: 0,
            pw_uppers: 0,
            pw_lowers: 0,
            pw_numbers: 0,
            pw_specials: 0,
            sysadmin_restrict: Vec::new(),
            logo_image: "/gfx/logo.png".to_string(),
            unknown_image: "/gfx/unknown_person.png".to_string(),
            showversion: true,
            sar: Vec::new(),
        }
    }
}

fn to_usize(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

/// Parses the space separated sysadmin restriction list.
///
/// # Errors
/// Returns `InvalidInput` naming the first malformed prefix.
pub fn parse_prefixes<S: AsRef<str>>(list: &[S]) -> Result<Vec<IpNetwork>> {
    list.iter()
        .map(AsRef::as_ref)
        .filter(|p| !p.is_empty())
        .map(|p| {
            IpNetwork::from_str(p)
                .map_err(|_| Error::invalid(format!("Invalid CIDR Prefix for SARestrict: {p}")))
        })
        .collect()
}

impl SystemConfig {
    #[must_use]
    pub fn pw_rules(&self) -> Rules {
        Rules {
            min_length: to_usize(self.pw_length),
            max_length: to_usize(self.pw_length_max),
            min_letters: to_usize(self.pw_letters),
            min_uppers: to_usize(self.pw_uppers),
            min_lowers: to_usize(self.pw_lowers),
            min_numbers: to_usize(self.pw_numbers),
            min_specials: to_usize(self.pw_specials),
        }
    }

    /// Whether an elevated sysadmin coming from `ip` keeps the elevation.
    #[must_use]
    pub fn sysadmin_allowed_from(&self, ip: Option<IpAddr>) -> bool {
        if self.sar.is_empty() {
            return true;
        }

        match ip.map(|ip| ip.to_canonical()) {
            Some(ip) if ip.is_loopback() => true,
            Some(ip) => self.sar.iter().any(|net| net.contains(ip)),
            None => false,
        }
    }

    /// Rebuilds the parsed prefix cache from `sysadmin_restrict`.
    ///
    /// # Errors
    /// See [`parse_prefixes`].
    pub fn compile(&mut self) -> Result<()> {
        self.sar = parse_prefixes(&self.sysadmin_restrict)?;
        Ok(())
    }

    fn str_slot(&mut self, column: &str) -> Option<&mut String> {
        Some(match column {
            "name" => &mut self.name,
            "welcome_text" => &mut self.welcome_text,
            "admin_name" => &mut self.admin_name,
            "admin_email" => &mut self.admin_email,
            "copy_years" => &mut self.copy_years,
            "email_domain" => &mut self.email_domain,
            "url_public" => &mut self.url_public,
            "people_domain" => &mut self.people_domain,
            "email_sig" => &mut self.email_sig,
            "logo_image" => &mut self.logo_image,
            "unknown_image" => &mut self.unknown_image,
            _ => return None,
        })
    }

    fn bool_slot(&mut self, column: &str) -> Option<&mut bool> {
        Some(match column {
            "admin_email_public" => &mut self.admin_email_public,
            "cli_enabled" => &mut self.cli_enabled,
            "api_enabled" => &mut self.api_enabled,
            "oauth_enabled" => &mut self.oauth_enabled,
            "no_index" => &mut self.no_index,
            "require2fa" => &mut self.require2fa,
            "pw_enforce" => &mut self.pw_enforce,
            "showversion" => &mut self.showversion,
            _ => return None,
        })
    }

    fn int_slot(&mut self, column: &str) -> Option<&mut i64> {
        Some(match column {
            "pw_length" => &mut self.pw_length,
            "pw_length_max" => &mut self.pw_length_max,
            "pw_letters" => &mut self.pw_letters,
            "pw_uppers" => &mut self.pw_uppers,
            "pw_lowers" => &mut self.pw_lowers,
            "pw_numbers" => &mut self.pw_numbers,
            "pw_specials" => &mut self.pw_specials,
            _ => return None,
        })
    }
}

impl Entity for SystemConfig {
    fn table(&self) -> &'static str {
        "config"
    }

    fn fields(&self) -> &'static [FieldDesc] {
        &FIELDS
    }

    fn get(&self, column: &str) -> Option<Value> {
        let s = |v: &String| Some(Value::Str(v.clone()));
        match column {
            "name" => s(&self.name),
            "welcome_text" => s(&self.welcome_text),
            "admin_name" => s(&self.admin_name),
            "admin_email" => s(&self.admin_email),
            "copy_years" => s(&self.copy_years),
            "email_domain" => s(&self.email_domain),
            "url_public" => s(&self.url_public),
            "people_domain" => s(&self.people_domain),
            "email_sig" => s(&self.email_sig),
            "logo_image" => s(&self.logo_image),
            "unknown_image" => s(&self.unknown_image),
            "admin_email_public" => Some(Value::Bool(self.admin_email_public)),
            "cli_enabled" => Some(Value::Bool(self.cli_enabled)),
            "api_enabled" => Some(Value::Bool(self.api_enabled)),
            "oauth_enabled" => Some(Value::Bool(self.oauth_enabled)),
            "no_index" => Some(Value::Bool(self.no_index)),
            "require2fa" => Some(Value::Bool(self.require2fa)),
            "pw_enforce" => Some(Value::Bool(self.pw_enforce)),
            "showversion" => Some(Value::Bool(self.showversion)),
            "pw_length" => Some(Value::Int(self.pw_length)),
            "pw_length_max" => Some(Value::Int(self.pw_length_max)),
            "pw_letters" => Some(Value::Int(self.pw_letters)),
            "pw_uppers" => Some(Value::Int(self.pw_uppers)),
            "pw_lowers" => Some(Value::Int(self.pw_lowers)),
            "pw_numbers" => Some(Value::Int(self.pw_numbers)),
            "pw_specials" => Some(Value::Int(self.pw_specials)),
            "sysadmin_restrict" => Some(Value::List(self.sysadmin_restrict.clone())),
            _ => None,
        }
    }

    fn put(&mut self, column: &str, value: Value) -> Result<()> {
        match value {
            Value::List(items) if column == "sysadmin_restrict" => {
                self.sysadmin_restrict = items;
                return Ok(());
            }
            Value::Str(s) => {
                if let Some(slot) = self.str_slot(column) {
                    *slot = s;
                    return Ok(());
                }
            }
            Value::Bool(b) => {
                if let Some(slot) = self.bool_slot(column) {
                    *slot = b;
                    return Ok(());
                }
            }
            Value::Int(n) => {
                if let Some(slot) = self.int_slot(column) {
                    *slot = n;
                    return Ok(());
                }
            }
            _ => {}
        }

        Err(Error::invalid(format!("Unknown property: {column}")))
    }

    fn keys(&self) -> Vec<(&'static str, Param)> {
        Vec::new()
    }

    /// Every setting is a text row keyed by its column name.
    fn update_sql(&self, field: &FieldDesc, value: Param) -> (String, Vec<Param>) {
        (
            "INSERT INTO config (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"
                .to_string(),
            vec![Param::text(field.column), Param::Text(value.to_string())],
        )
    }
}

/// Read-mostly holder of the current [`SystemConfig`].
#[derive(Debug, Default)]
pub struct System {
    current: RwLock<SystemConfig>,
}

impl System {
    #[must_use]
    pub fn new(config: SystemConfig) -> Self {
        Self {
            current: RwLock::new(config),
        }
    }

    /// A copy of the current settings.
    #[must_use]
    pub fn get(&self) -> SystemConfig {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, config: SystemConfig) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Reloads the settings from the store.
    ///
    /// Unknown keys and unparsable values are logged and skipped. When the
    /// table cannot be read the conservative defaults (CLI and API off) are
    /// installed and the error is returned.
    ///
    /// # Errors
    /// The store error, or `InvalidInput` for a malformed sysadmin prefix.
    pub async fn refresh(&self, pool: &PgPool, time_format: &str) -> Result<()> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "SELECT");
        let rows = match sqlx::query("SELECT key, value FROM config")
            .fetch_all(pool)
            .instrument(span)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!("Configuration fetch failed: {err}");
                self.replace(SystemConfig {
                    cli_enabled: false,
                    api_enabled: false,
                    ..SystemConfig::default()
                });
                return Err(err.into());
            }
        };

        let mut config = SystemConfig::default();
        for row in &rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;

            let Some(field) = find_field(&FIELDS, &key) else {
                warn!("Unknown system configuration variable {key:?}, ignoring");
                continue;
            };

            match field
                .coerce(&value, time_format)
                .and_then(|v| config.put(field.column, v))
            {
                Ok(()) => debug!("config {key} loaded"),
                Err(err) => warn!("Ignoring system configuration variable {key:?}: {err}"),
            }
        }

        config.compile()?;
        self.replace(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn defaults() {
        let config = SystemConfig::default();
        assert!(config.api_enabled);
        assert!(!config.cli_enabled);
        assert_eq!(config.pw_rules().min_length, 12);
        assert!(config.sysadmin_allowed_from(None));
    }

    #[test]
    fn sysadmin_restriction() {
        let mut config = SystemConfig {
            sysadmin_restrict: vec!["192.0.2.0/24".into(), "2001:db8::/32".into()],
            ..SystemConfig::default()
        };
        config.compile().unwrap();

        assert!(config.sysadmin_allowed_from(Some("192.0.2.77".parse().unwrap())));
        assert!(config.sysadmin_allowed_from(Some("2001:db8::1".parse().unwrap())));
        assert!(config.sysadmin_allowed_from(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))));
        assert!(config.sysadmin_allowed_from(Some("::1".parse().unwrap())));
        assert!(!config.sysadmin_allowed_from(Some("198.51.100.1".parse().unwrap())));
        assert!(!config.sysadmin_allowed_from(None));

        assert!(config.sysadmin_allowed_from(Some("::ffff:192.0.2.4".parse().unwrap())));
        assert!(config.sysadmin_allowed_from(Some("::ffff:127.0.0.1".parse().unwrap())));
        assert!(!config.sysadmin_allowed_from(Some("::ffff:198.51.100.1".parse().unwrap())));
    }

    #[test]
    fn malformed_prefix_is_rejected() {
        let err = parse_prefixes(&["10.0.0.0/8", "nonsense"]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid CIDR Prefix for SARestrict: nonsense");
    }

    #[test]
    fn get_and_put_by_column() {
        let mut config = SystemConfig::default();
        config.put("name", Value::Str("Tickly".into())).unwrap();
        config.put("require2fa", Value::Bool(true)).unwrap();
        config.put("pw_length", Value::Int(16)).unwrap();
        assert_eq!(config.get("name"), Some(Value::Str("Tickly".into())));
        assert_eq!(config.get("require2fa"), Some(Value::Bool(true)));
        assert_eq!(config.get("pw_length"), Some(Value::Int(16)));
        assert_eq!(config.get("nope"), None);
        assert!(config.put("name", Value::Int(1)).is_err());
    }

    #[test]
    fn settings_are_stored_as_text() {
        let config = SystemConfig::default();
        let field = find_field(&FIELDS, "require2fa").unwrap();
        let (sql, params) = config.update_sql(field, Param::Bool(true));
        assert!(sql.starts_with("INSERT INTO config"));
        assert_eq!(params, vec![Param::text("require2fa"), Param::text("yes")]);
    }

    #[test]
    fn descriptor_table_matches_slots() {
        let config = SystemConfig::default();
        for field in &FIELDS {
            assert!(config.get(field.column).is_some(), "{}", field.column);
        }
    }
}
