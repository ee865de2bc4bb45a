use serde::Deserialize;
use std::path::{Path, PathBuf};
use outlay_common::{
    error::ConfigError, ModeRequest, OutlayError, OutputSelector, Position, Profile, ProfileOutputRule, Result,
    Transform,
};

/// Includes nested deeper than this are treated as a cycle
const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub include: Vec<String>,
    /// Output defaults, merged into profile outputs with the same criteria
    #[serde(default, rename = "output")]
    pub outputs: Vec<OutputConfig>,
    #[serde(default, rename = "profile")]
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub criteria: String,
    pub enable: Option<bool>,
    /// `WxH`, `WxH@R` or `WxH@RHz`
    pub mode: Option<String>,
    #[serde(default)]
    pub custom_mode: bool,
    /// `X,Y`
    pub position: Option<String>,
    pub scale: Option<f64>,
    pub transform: Option<Transform>,
    pub adaptive_sync: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub exec: Vec<String>,
    #[serde(default, rename = "output")]
    pub outputs: Vec<OutputConfig>,
}

impl Config {
    /// Loads `path`, or the default configuration file when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        let config = Self::load_from_path(&config_path)?;

        log::info!(
            "Loaded configuration from {:?} ({} profiles)",
            config_path,
            config.profiles.len()
        );
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| OutlayError::Config(ConfigError::NoConfigDir))?
            .join("outlay");

        Ok(config_dir.join("config.toml"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config = Self::load_file(path, 0)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    fn load_file(path: &Path, depth: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OutlayError::Config(ConfigError::FileRead {
                path: path.to_path_buf(),
                source: e,
            }))?;

        let mut own = Self::parse(&content)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        // Included entries come first, `include` precedes every table
        let mut config = Config::default();
        for include in std::mem::take(&mut own.include) {
            if depth >= MAX_INCLUDE_DEPTH {
                return Err(OutlayError::Config(ConfigError::Include {
                    path: include,
                    message: "includes nested too deeply".to_string(),
                }));
            }

            let included_path = resolve_include(&include, base_dir)?;
            log::debug!("Including {:?} from {:?}", included_path, path);
            let included = Self::load_file(&included_path, depth + 1).map_err(|e| {
                OutlayError::Config(ConfigError::Include {
                    path: include.clone(),
                    message: e.to_string(),
                })
            })?;
            config.outputs.extend(included.outputs);
            config.profiles.extend(included.profiles);
        }
        config.outputs.extend(own.outputs);
        config.profiles.extend(own.profiles);

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for output in &self.outputs {
            output.to_rule().map_err(|e| validation_error(format!("Output defaults: {}", e)))?;
        }

        for (index, profile) in self.profiles.iter().enumerate() {
            let label = profile.name.clone().unwrap_or_else(|| format!("#{}", index + 1));
            if profile.outputs.is_empty() {
                return Err(validation_error(format!("Profile '{}' has no outputs", label)));
            }
            for output in &profile.outputs {
                output.to_rule().map_err(|e| validation_error(format!("Profile '{}': {}", label, e)))?;
            }
        }

        Ok(())
    }

    /// Builds the runtime profiles with output defaults applied. Unnamed
    /// profiles are numbered in file order.
    pub fn into_profiles(&self) -> Result<Vec<Profile>> {
        let defaults = self
            .outputs
            .iter()
            .map(OutputConfig::to_rule)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut anonymous = 0;
        let mut profiles = Vec::with_capacity(self.profiles.len());
        for profile in &self.profiles {
            let name = match &profile.name {
                Some(name) => name.clone(),
                None => {
                    anonymous += 1;
                    format!("<anonymous profile {}>", anonymous)
                }
            };

            let mut rules = Vec::with_capacity(profile.outputs.len());
            for output in &profile.outputs {
                let mut rule = output.to_rule()?;
                if let Some(default) = defaults.iter().find(|d| d.selector == rule.selector) {
                    rule.apply_defaults(default);
                }
                rules.push(rule);
            }

            profiles.push(Profile::new(name, rules, profile.exec.clone()));
        }

        Ok(profiles)
    }
}

impl OutputConfig {
    pub fn to_rule(&self) -> std::result::Result<ProfileOutputRule, ConfigError> {
        if self.criteria.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "criteria".to_string(),
                value: String::new(),
            });
        }

        if let Some(scale) = self.scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: "scale".to_string(),
                    value: scale.to_string(),
                });
            }
        }

        let mut rule = ProfileOutputRule::new(OutputSelector::parse(&self.criteria));
        rule.enabled = self.enable;
        rule.mode = self
            .mode
            .as_deref()
            .map(|mode| parse_mode(mode, self.custom_mode))
            .transpose()?;
        rule.position = self.position.as_deref().map(parse_position).transpose()?;
        rule.scale = self.scale;
        rule.transform = self.transform;
        rule.adaptive_sync = self.adaptive_sync;
        Ok(rule)
    }
}

/// Parses `WxH`, `WxH@R` or `WxH@RHz`, the refresh rate given in Hz
pub fn parse_mode(value: &str, custom: bool) -> std::result::Result<ModeRequest, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        field: "mode".to_string(),
        value: value.to_string(),
    };

    let (width, rest) = value.split_once('x').ok_or_else(invalid)?;
    let (height, refresh) = match rest.split_once('@') {
        Some((height, refresh)) => (height, Some(refresh)),
        None => (rest, None),
    };

    let width: i32 = width.trim().parse().map_err(|_| invalid())?;
    let height: i32 = height.trim().parse().map_err(|_| invalid())?;
    let refresh = match refresh {
        Some(refresh) => {
            let hz: f64 = refresh
                .strip_suffix("Hz")
                .unwrap_or(refresh)
                .trim()
                .parse()
                .map_err(|_| invalid())?;
            if !hz.is_finite() || hz < 0.0 {
                return Err(invalid());
            }
            // A zero rate means no rate was requested
            Some((hz * 1000.0).round() as i32).filter(|refresh| *refresh != 0)
        }
        None => None,
    };

    if width <= 0 || height <= 0 {
        return Err(invalid());
    }

    Ok(ModeRequest { width, height, refresh, custom })
}

/// Parses `X,Y`
pub fn parse_position(value: &str) -> std::result::Result<Position, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        field: "position".to_string(),
        value: value.to_string(),
    };

    let (x, y) = value.split_once(',').ok_or_else(invalid)?;
    Ok(Position {
        x: x.trim().parse().map_err(|_| invalid())?,
        y: y.trim().parse().map_err(|_| invalid())?,
    })
}

/// Expands `~` and `$VAR` in an include path and resolves it against the
/// including file's directory
fn resolve_include(raw: &str, base_dir: &Path) -> Result<PathBuf> {
    let expanded = expand_path(raw)?;
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(base_dir.join(path))
    }
}

fn expand_path(raw: &str) -> Result<String> {
    let include_error = |message: String| {
        OutlayError::Config(ConfigError::Include {
            path: raw.to_string(),
            message,
        })
    };

    let mut expanded = String::with_capacity(raw.len());
    let mut rest = raw;

    if rest == "~" || rest.starts_with("~/") {
        let home = dirs::home_dir().ok_or_else(|| include_error("home directory unknown".to_string()))?;
        expanded.push_str(&home.to_string_lossy());
        rest = &rest[1..];
    }

    while let Some(start) = rest.find('$') {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let (name, remainder) = if let Some(braced) = after.strip_prefix('{') {
            let end = braced
                .find('}')
                .ok_or_else(|| include_error("unterminated variable".to_string()))?;
            (&braced[..end], &braced[end + 1..])
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], &after[end..])
        };

        if name.is_empty() {
            expanded.push('$');
        } else {
            let value = std::env::var(name)
                .map_err(|_| include_error(format!("variable {} is not set", name)))?;
            expanded.push_str(&value);
        }
        rest = remainder;
    }
    expanded.push_str(rest);

    Ok(expanded)
}

fn validation_error(message: String) -> OutlayError {
    OutlayError::Config(ConfigError::Validation { message })
}
