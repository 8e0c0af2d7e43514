//! Layered configuration. Every value is looked up in an explicit override map first, then in a
//! snapshot of the process environment, and finally falls back to a default. Resolution happens
//! once per invocation, after which [`Settings`] is immutable.

use std::collections::{BTreeMap, BTreeSet};

use constcat::concat;
use image_ref::{ImageName, InvalidImageName};
use itertools::Itertools;

const PROPERTY_PREFIX: &str = "solr.docker.";
const ENV_PREFIX: &str = "SOLR_DOCKER_";

/// The names under which a configuration value can be provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    /// Key in the explicit override map, set with `-P <property>=<value>`.
    pub property: &'static str,
    pub env_var: &'static str,
}

pub const IMAGE_REPO: Setting = Setting {
    property: concat!(PROPERTY_PREFIX, "imageRepo"),
    env_var: concat!(ENV_PREFIX, "IMAGE_REPO"),
};

pub const IMAGE_TAG: Setting = Setting {
    property: concat!(PROPERTY_PREFIX, "imageTag"),
    env_var: concat!(ENV_PREFIX, "IMAGE_TAG"),
};

pub const IMAGE_NAME: Setting = Setting {
    property: concat!(PROPERTY_PREFIX, "imageName"),
    env_var: concat!(ENV_PREFIX, "IMAGE_NAME"),
};

pub const BASE_IMAGE: Setting = Setting {
    property: concat!(PROPERTY_PREFIX, "baseImage"),
    env_var: concat!(ENV_PREFIX, "BASE_IMAGE"),
};

pub const GITHUB_URL: Setting = Setting {
    property: concat!(PROPERTY_PREFIX, "githubUrl"),
    env_var: concat!(ENV_PREFIX, "GITHUB_URL"),
};

pub const TESTS_INCLUDE: Setting = Setting {
    property: concat!(PROPERTY_PREFIX, "tests.include"),
    env_var: concat!(ENV_PREFIX, "TESTS_INCLUDE"),
};

pub const TESTS_EXCLUDE: Setting = Setting {
    property: concat!(PROPERTY_PREFIX, "tests.exclude"),
    env_var: concat!(ENV_PREFIX, "TESTS_EXCLUDE"),
};

pub const DEFAULT_IMAGE_REPO: &str = "apache/solr";
pub const DEFAULT_BASE_IMAGE: &str = "eclipse-temurin:17-jre-jammy";
pub const DEFAULT_GITHUB_URL: &str = "github.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Override,
    Environment,
    Default,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Origin::Override => "override",
            Origin::Environment => "environment",
            Origin::Default => "default",
        })
    }
}

/// Looks up `name` in `overrides`, then `env_var` in `environment`, then returns `default`.
///
/// A variable that is set to the empty string counts as set.
pub fn resolve(
    overrides: &BTreeMap<String, String>,
    environment: &BTreeMap<String, String>,
    name: &str,
    env_var: &str,
    default: &str,
) -> (String, Origin) {
    if let Some(value) = overrides.get(name) {
        (value.clone(), Origin::Override)
    } else if let Some(value) = environment.get(env_var) {
        (value.clone(), Origin::Environment)
    } else {
        (default.to_owned(), Origin::Default)
    }
}

/// The explicit override map together with an environment snapshot.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    pub overrides: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
}

impl Sources {
    pub fn new(overrides: BTreeMap<String, String>, environment: BTreeMap<String, String>) -> Self {
        Self {
            overrides,
            environment,
        }
    }

    /// Snapshots the environment of the current process. Variables that are not valid unicode are
    /// left out.
    pub fn from_process(overrides: BTreeMap<String, String>) -> Self {
        let environment = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        Self::new(overrides, environment)
    }

    pub fn resolve(&self, setting: Setting, default: &str) -> (String, Origin) {
        resolve(
            &self.overrides,
            &self.environment,
            setting.property,
            setting.env_var,
            default,
        )
    }
}

/// Splits a comma separated list, ignoring surrounding whitespace and empty elements. Anything
/// else is taken verbatim.
pub fn parse_list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|element| !element.is_empty())
        .map(str::to_owned)
        .collect()
}

/// All configuration values of a run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub version: String,
    pub image_repo: String,
    pub image_tag: String,
    /// An explicitly configured image name. Validated by [`Settings::image_name`].
    pub explicit_image_name: Option<String>,
    pub base_image: String,
    pub github_url: String,
    pub tests_include: BTreeSet<String>,
    pub tests_exclude: BTreeSet<String>,
    resolved: Vec<(Setting, String, Origin)>,
}

impl Settings {
    pub fn resolve(sources: &Sources, version: &str) -> Self {
        let mut resolved = Vec::new();
        let mut get = |setting: Setting, default: &str| {
            let (value, origin) = sources.resolve(setting, default);
            resolved.push((setting, value.clone(), origin));
            (value, origin)
        };

        let (image_repo, _) = get(IMAGE_REPO, DEFAULT_IMAGE_REPO);
        let (image_tag, _) = get(IMAGE_TAG, version);
        let (image_name, image_name_origin) = get(IMAGE_NAME, &format!("{image_repo}:{image_tag}"));
        let explicit_image_name = (image_name_origin != Origin::Default).then_some(image_name);
        let (base_image, _) = get(BASE_IMAGE, DEFAULT_BASE_IMAGE);
        let (github_url, _) = get(GITHUB_URL, DEFAULT_GITHUB_URL);
        let tests_include = parse_list(&get(TESTS_INCLUDE, "").0);
        let tests_exclude = parse_list(&get(TESTS_EXCLUDE, "").0);

        Self {
            version: version.to_owned(),
            image_repo,
            image_tag,
            explicit_image_name,
            base_image,
            github_url,
            tests_include,
            tests_exclude,
            resolved,
        }
    }

    /// The configured image name, or `<repo>:<tag>` when none is configured.
    pub fn image_name(&self) -> Result<ImageName, InvalidImageName> {
        match &self.explicit_image_name {
            Some(name) => ImageName::new(name.clone()),
            None => ImageName::from_repository_and_tag(&self.image_repo, &self.image_tag),
        }
    }

    /// Every resolved value with the names it can be set under and where it came from.
    pub fn resolved(&self) -> &[(Setting, String, Origin)] {
        &self.resolved
    }

    pub fn table(&self) -> comfy_table::Table {
        let mut table = comfy_table::Table::new();
        table.load_preset(comfy_table::presets::UTF8_FULL_CONDENSED);
        table.set_header(["property", "environment variable", "value", "source"]);
        table.add_row(["(product version)", "", self.version.as_str(), ""]);
        for (setting, value, origin) in self.resolved() {
            table.add_row(vec![
                setting.property.to_owned(),
                setting.env_var.to_owned(),
                value.clone(),
                origin.to_string(),
            ]);
        }
        table
    }
}

/// Parses a `key=value` override as passed to `-P`.
pub fn parse_override(value: &str) -> Result<(String, String), String> {
    let (key, value) = value
        .split_once('=')
        .ok_or_else(|| format!("expected `<property>=<value>`, got {value:?}"))?;
    if key.is_empty() {
        return Err("property name must not be empty".to_owned());
    }
    Ok((key.to_owned(), value.to_owned()))
}

/// Infers the product version from the release archives, named `solr-<version>.tgz` or
/// `solr-<version>-slim.tgz`. Other archives, such as `solr-<version>-src.tgz`, are ignored.
pub fn infer_version<'a, I>(file_names: I) -> Result<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let versions = file_names
        .into_iter()
        .filter_map(|name| name.strip_prefix("solr-")?.strip_suffix(".tgz"))
        .map(|version| version.strip_suffix("-slim").unwrap_or(version))
        .filter(|version| is_release_version(version))
        .collect::<BTreeSet<_>>();

    match versions.len() {
        1 => Ok(versions.into_iter().next().unwrap_or_default().to_owned()),
        0 => Err("no `solr-<version>.tgz` release archive found, pass --solr-version".to_owned()),
        _ => Err(format!(
            "found release archives for several versions ({}), pass --solr-version",
            versions.iter().join(", ")
        )),
    }
}

/// A dotted version such as `9.5.0`, without any `-<classifier>` suffix.
fn is_release_version(version: &str) -> bool {
    version.starts_with(|c: char| c.is_ascii_digit())
        && version.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
}
