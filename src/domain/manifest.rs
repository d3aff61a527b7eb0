//! Compose manifests.
//!
//! A [`Manifest`] keeps the document exactly as it was given, key order
//! included, so it can be handed back untouched. [`ComposeProject`] is the
//! validated view over the subset this service understands: services with
//! their image, ports, volumes, environment, restart policy, container name,
//! networks and command, plus the top-level `networks` and `volumes` keys.
//! Any shape outside that subset is rejected before a view is built.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| Error::malformed("$", format!("not a valid YAML document: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::malformed("$", format!("manifest is not UTF-8: {e}")))?;
        Self::parse(text)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_mapping() {
            return Err(Error::malformed("$", "manifest root must be a mapping"));
        }
        Ok(Self(value))
    }

    pub fn from_mapping(root: Mapping) -> Self {
        Self(Value::Mapping(root))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.0)
            .map_err(|e| Error::malformed("$", format!("manifest cannot be rendered: {e}")))
    }

    /// Top-level string entry, e.g. `name`.
    pub fn top_level_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn extension(&self, key: &str) -> Option<&Mapping> {
        self.0.get(key).and_then(Value::as_mapping)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl VolumeBinding {
    /// Named volumes are declared without a path prefix.
    pub fn is_named(&self) -> bool {
        !(self.host.starts_with('/') || self.host.starts_with('.') || self.host.starts_with('~'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceSpec {
    pub name: String,
    pub image: Option<String>,
    pub container_name: Option<String>,
    pub restart: Option<String>,
    pub command: Vec<String>,
    pub networks: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<VolumeBinding>,
    pub environment: Vec<(String, String)>,
}

impl ServiceSpec {
    /// One service body, validated the same way as inside a manifest.
    pub fn parse(name: &str, body: &Value) -> Result<Self> {
        parse_service(name, body)
    }

    pub fn require_deployable(&self) -> Result<()> {
        if self.image.is_none() {
            return Err(Error::malformed(
                format!("services.{}.image", self.name),
                "an image is required to deploy",
            ));
        }
        match self
            .volumes
            .iter()
            .position(|volume| volume.host.starts_with('.') || volume.host.starts_with('~'))
        {
            Some(i) => Err(Error::malformed(
                format!("services.{}.volumes[{i}]", self.name),
                format!("bind source {:?} must be an absolute path", self.volumes[i].host),
            )),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub services: Vec<ServiceSpec>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
}

impl ComposeProject {
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        // `<<` merge keys are resolved on a copy; the manifest itself stays verbatim.
        let mut root = manifest.as_value().clone();
        root.apply_merge()
            .map_err(|e| Error::malformed("$", format!("merge keys cannot be applied: {e}")))?;
        let services = root
            .get("services")
            .ok_or_else(|| Error::malformed("services", "manifest declares no services"))?
            .as_mapping()
            .ok_or_else(|| Error::malformed("services", "must be a mapping"))?;
        if services.is_empty() {
            return Err(Error::malformed("services", "manifest declares no services"));
        }

        let services = services
            .iter()
            .map(|(name, body)| {
                let name = name
                    .as_str()
                    .ok_or_else(|| Error::malformed("services", "service names must be strings"))?;
                parse_service(name, body)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            services,
            networks: top_level_keys(&root, "networks")?,
            volumes: top_level_keys(&root, "volumes")?,
        })
    }

    pub fn primary(&self) -> &ServiceSpec {
        &self.services[0]
    }

    /// Deploying needs an image for every service and absolute bind sources,
    /// the daemon has no working directory to resolve relative ones against.
    pub fn require_deployable(&self) -> Result<()> {
        for service in &self.services {
            service.require_deployable()?;
        }
        Ok(())
    }
}

fn top_level_keys(root: &Value, key: &str) -> Result<Vec<String>> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Mapping(entries)) => entries
            .keys()
            .map(|name| {
                name.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::malformed(key, "names must be strings"))
            })
            .collect(),
        Some(_) => Err(Error::malformed(key, "must be a mapping")),
    }
}

fn parse_service(name: &str, body: &Value) -> Result<ServiceSpec> {
    let field = |suffix: &str| format!("services.{name}.{suffix}");
    let body = match body {
        Value::Mapping(body) => body,
        Value::Null => {
            return Ok(ServiceSpec {
                name: name.to_string(),
                ..Default::default()
            })
        }
        _ => return Err(Error::malformed(format!("services.{name}"), "must be a mapping")),
    };

    Ok(ServiceSpec {
        name: name.to_string(),
        image: optional_str(body, "image", &field("image"))?,
        container_name: optional_str(body, "container_name", &field("container_name"))?,
        restart: optional_str(body, "restart", &field("restart"))?,
        command: parse_command(body.get("command"), &field("command"))?,
        networks: parse_networks(body.get("networks"), &field("networks"))?,
        ports: sequence(body.get("ports"), &field("ports"))?
            .iter()
            .enumerate()
            .map(|(i, entry)| parse_port(entry, &format!("{}[{i}]", field("ports"))))
            .collect::<Result<_>>()?,
        volumes: sequence(body.get("volumes"), &field("volumes"))?
            .iter()
            .enumerate()
            .map(|(i, entry)| parse_volume(entry, &format!("{}[{i}]", field("volumes"))))
            .collect::<Result<_>>()?,
        environment: parse_environment(body.get("environment"), &field("environment"))?,
    })
}

fn optional_str(body: &Mapping, key: &str, field: &str) -> Result<Option<String>> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(Error::malformed(field, "must be a string")),
    }
}

fn sequence<'a>(value: Option<&'a Value>, field: &str) -> Result<&'a [Value]> {
    match value {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Sequence(entries)) => Ok(entries),
        Some(_) => Err(Error::malformed(field, "must be a list")),
    }
}

fn parse_command(value: Option<&Value>, field: &str) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(command)) => Ok(command.split_whitespace().map(str::to_string).collect()),
        Some(Value::Sequence(parts)) => parts
            .iter()
            .map(|part| scalar_to_string(part).ok_or_else(|| Error::malformed(field, "arguments must be scalars")))
            .collect(),
        Some(_) => Err(Error::malformed(field, "must be a string or a list")),
    }
}

fn parse_networks(value: Option<&Value>, field: &str) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(names)) => names
            .iter()
            .map(|name| {
                name.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::malformed(field, "network names must be strings"))
            })
            .collect(),
        Some(Value::Mapping(names)) => names
            .keys()
            .map(|name| {
                name.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::malformed(field, "network names must be strings"))
            })
            .collect(),
        Some(_) => Err(Error::malformed(field, "must be a list or a mapping")),
    }
}

/// `"HOST:CONTAINER"`, both sides numeric.
pub fn parse_port(entry: &Value, field: &str) -> Result<PortBinding> {
    let text = entry
        .as_str()
        .ok_or_else(|| Error::malformed(field, "port must be a \"HOST:CONTAINER\" string"))?;
    let (host, container) = text
        .split_once(':')
        .ok_or_else(|| Error::malformed(field, format!("port {text:?} lacks a ':' separator")))?;
    let number = |side: &str| {
        side.parse::<u16>()
            .map_err(|_| Error::malformed(field, format!("port {text:?} has a non-numeric side {side:?}")))
    };
    Ok(PortBinding {
        host: number(host)?,
        container: number(container)?,
    })
}

/// `"HOST:CONTAINER"` or `"HOST:CONTAINER:MODE"`, sides kept as paths.
pub fn parse_volume(entry: &Value, field: &str) -> Result<VolumeBinding> {
    let text = entry
        .as_str()
        .ok_or_else(|| Error::malformed(field, "volume must be a \"HOST:CONTAINER\" string"))?;
    let parts: Vec<&str> = text.split(':').collect();
    let (host, container, read_only) = match parts.as_slice() {
        [host, container] => (*host, *container, false),
        [host, container, "ro"] => (*host, *container, true),
        [host, container, "rw"] => (*host, *container, false),
        [_] => return Err(Error::malformed(field, format!("volume {text:?} lacks a ':' separator"))),
        _ => return Err(Error::malformed(field, format!("volume {text:?} is not HOST:CONTAINER[:ro|rw]"))),
    };
    if host.is_empty() || container.is_empty() {
        return Err(Error::malformed(field, format!("volume {text:?} has an empty side")));
    }
    Ok(VolumeBinding {
        host: host.to_string(),
        container: container.to_string(),
        read_only,
    })
}

pub fn parse_environment(value: Option<&Value>, field: &str) -> Result<Vec<(String, String)>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(entries)) => entries
            .iter()
            .enumerate()
            .map(|(i, entry)| parse_env_entry(entry, &format!("{field}[{i}]")))
            .collect(),
        Some(Value::Mapping(entries)) => entries
            .iter()
            .map(|(name, value)| {
                let name = name
                    .as_str()
                    .ok_or_else(|| Error::malformed(field, "variable names must be strings"))?;
                let value = scalar_to_string(value).ok_or_else(|| {
                    Error::malformed(format!("{field}.{name}"), "variable has no explicit value")
                })?;
                Ok((name.to_string(), value))
            })
            .collect(),
        Some(_) => Err(Error::malformed(field, "must be a list or a mapping")),
    }
}

fn parse_env_entry(entry: &Value, field: &str) -> Result<(String, String)> {
    match entry {
        Value::String(text) => {
            let (name, value) = text
                .split_once('=')
                .ok_or_else(|| Error::malformed(field, format!("{text:?} has no '=' and no explicit value")))?;
            if name.is_empty() {
                return Err(Error::malformed(field, format!("{text:?} has an empty name")));
            }
            Ok((name.to_string(), value.to_string()))
        }
        Value::Mapping(pair) => {
            let name = pair
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::malformed(field, "pair needs a string name"))?;
            let value = pair
                .get("value")
                .and_then(scalar_to_string)
                .ok_or_else(|| Error::malformed(field, format!("{name} has no explicit value")))?;
            Ok((name.to_string(), value))
        }
        _ => Err(Error::malformed(field, "must be \"NAME=VALUE\" or a name/value pair")),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(text: &str) -> Manifest {
        Manifest::parse(text).unwrap()
    }

    #[test]
    fn rejects_non_mapping_roots_and_bad_bytes() {
        assert!(matches!(Manifest::parse("- a\n- b"), Err(Error::MalformedManifest { .. })));
        assert!(matches!(Manifest::parse("services: ["), Err(Error::MalformedManifest { .. })));
        assert!(matches!(Manifest::from_slice(&[0xff, 0xfe]), Err(Error::MalformedManifest { .. })));
    }

    #[test]
    fn services_keep_declared_order() {
        let project = ComposeProject::from_manifest(&manifest(
            "services:\n  zeta:\n    image: a\n  alpha:\n    image: b\n  mid:\n    image: c\n",
        ))
        .unwrap();
        let names: Vec<_> = project.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        assert_eq!(project.primary().name, "zeta");
    }

    #[test]
    fn missing_or_empty_services_is_malformed() {
        for text in ["version: '3'", "services: {}", "services: [web]"] {
            let err = ComposeProject::from_manifest(&manifest(text)).unwrap_err();
            assert!(matches!(err, Error::MalformedManifest { ref field, .. } if field == "services"), "{text}");
        }
    }

    #[test]
    fn ports_must_be_numeric_pairs() {
        assert_eq!(
            parse_port(&Value::String("8080:80".into()), "p").unwrap(),
            PortBinding { host: 8080, container: 80 }
        );
        for bad in ["8080", "abc:80", "80:http", "1:2:3", "70000:80"] {
            assert!(parse_port(&Value::String(bad.into()), "p").is_err(), "{bad}");
        }
        assert!(parse_port(&Value::Number(80.into()), "p").is_err());
    }

    #[test]
    fn bad_port_names_the_offending_field() {
        let err = ComposeProject::from_manifest(&manifest(
            "services:\n  web:\n    image: nginx\n    ports: ['80:80', 'abc:80']\n",
        ))
        .unwrap_err();
        match err {
            Error::MalformedManifest { field, .. } => assert_eq!(field, "services.web.ports[1]"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn volumes_keep_paths_and_mode() {
        let bind = parse_volume(&Value::String("./data:/var/lib/data:ro".into()), "v").unwrap();
        assert_eq!(bind.host, "./data");
        assert_eq!(bind.container, "/var/lib/data");
        assert!(bind.read_only);
        assert!(!bind.is_named());
        assert!(parse_volume(&Value::String("dbdata:/db".into()), "v").unwrap().is_named());
        assert!(parse_volume(&Value::String("/only".into()), "v").is_err());
        assert!(parse_volume(&Value::String("a:b:c".into()), "v").is_err());
    }

    #[test]
    fn environment_accepts_all_three_shapes() {
        let list: Value = serde_yaml::from_str("['A=1', 'URL=http://x?a=b', {name: B, value: two}]").unwrap();
        assert_eq!(
            parse_environment(Some(&list), "e").unwrap(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("URL".to_string(), "http://x?a=b".to_string()),
                ("B".to_string(), "two".to_string()),
            ]
        );
        let map: Value = serde_yaml::from_str("{PORT: 80, DEBUG: true}").unwrap();
        assert_eq!(
            parse_environment(Some(&map), "e").unwrap(),
            vec![("PORT".to_string(), "80".to_string()), ("DEBUG".to_string(), "true".to_string())]
        );
    }

    #[test]
    fn environment_without_value_is_rejected() {
        for text in ["['NOVALUE']", "{EMPTY: null}", "[{name: X}]"] {
            let value: Value = serde_yaml::from_str(text).unwrap();
            assert!(parse_environment(Some(&value), "e").is_err(), "{text}");
        }
    }

    #[test]
    fn deploy_requires_images() {
        let project = ComposeProject::from_manifest(&manifest(
            "services:\n  web:\n    image: nginx\n  worker:\n    command: run\n",
        ))
        .unwrap();
        match project.require_deployable() {
            Err(Error::MalformedManifest { field, .. }) => assert_eq!(field, "services.worker.image"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deploy_requires_absolute_bind_sources() {
        let project = ComposeProject::from_manifest(&manifest(
            "services:\n  web:\n    image: nginx\n    volumes: ['/srv/html:/usr/share/nginx/html', './conf:/etc/nginx:ro']\n",
        ))
        .unwrap();
        match project.require_deployable() {
            Err(Error::MalformedManifest { field, .. }) => assert_eq!(field, "services.web.volumes[1]"),
            other => panic!("unexpected {other:?}"),
        }

        let named = ComposeProject::from_manifest(&manifest(
            "services:\n  db:\n    image: postgres\n    volumes: ['dbdata:/var/lib/postgresql/data']\nvolumes:\n  dbdata:\n",
        ))
        .unwrap();
        assert!(named.require_deployable().is_ok());
    }

    #[test]
    fn merge_keys_feed_the_view_but_not_the_stored_document() {
        let text = "x-base: &base\n  image: nginx:1.25\n  ports: ['8080:80']\nservices:\n  web:\n    <<: *base\n    restart: always\n";
        let m = manifest(text);
        let project = ComposeProject::from_manifest(&m).unwrap();
        let web = project.primary();
        assert_eq!(web.image.as_deref(), Some("nginx:1.25"));
        assert_eq!(web.ports, vec![PortBinding { host: 8080, container: 80 }]);
        assert_eq!(web.restart.as_deref(), Some("always"));
        assert!(project.require_deployable().is_ok());

        let web_body = m.as_value().get("services").and_then(|s| s.get("web")).unwrap();
        assert!(web_body.get("<<").is_some());
        assert!(web_body.get("image").is_none());
    }

    #[test]
    fn top_level_networks_and_volumes_are_listed() {
        let project = ComposeProject::from_manifest(&manifest(
            "services:\n  db:\n    image: postgres\n    networks: [back]\nnetworks:\n  back: {}\nvolumes:\n  dbdata:\n",
        ))
        .unwrap();
        assert_eq!(project.networks, ["back"]);
        assert_eq!(project.volumes, ["dbdata"]);
        assert_eq!(project.services[0].networks, ["back"]);
    }
}
