//! Mapping between compose manifests and [`AppTemplate`] records.
//!
//! The first service in declared key order stands for the whole template:
//! the `ports`, `volumes` and `environment` views are taken from it alone.
//! Other services are only carried inside the preserved manifest.

use std::collections::BTreeSet;

use serde_yaml::{Mapping, Value};

use super::error::{validate_name, Error, Result};
use super::manifest::{ComposeProject, Manifest, ServiceSpec};
use super::model::{AppTemplate, EnvVar, PortMapping, VolumeMapping};

pub const DEFAULT_DESCRIPTION: &str = "No description provided";
pub const DEFAULT_CATEGORY: &str = "uncategorized";
pub const DEFAULT_AUTHOR: &str = "unknown";
pub const DEFAULT_VERSION: &str = "latest";

/// Compose extension key carrying template metadata.
const METADATA_KEY: &str = "x-app";

pub fn to_template(manifest: &Manifest, id_hint: Option<&str>) -> Result<AppTemplate> {
    let project = ComposeProject::from_manifest(manifest)?;
    let primary = project.primary();
    let meta = Metadata::read(manifest);

    let id_source = id_hint
        .map(str::to_string)
        .or_else(|| meta.text("id"))
        .or_else(|| manifest.top_level_str("name").map(str::to_string))
        .unwrap_or_else(|| primary.name.clone());
    let id = slugify(&id_source);
    if id.is_empty() {
        return Err(Error::MissingId);
    }
    validate_name(&id)?;

    let (ports, volumes, environment) = views(primary);
    Ok(AppTemplate {
        name: meta
            .text("name")
            .or_else(|| manifest.top_level_str("name").map(str::to_string))
            .unwrap_or_else(|| primary.name.clone()),
        description: meta.text("description").unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        category: meta.text("category").unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        version: meta
            .text("version")
            .or_else(|| primary.image.as_deref().and_then(image_tag))
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        logo: meta.text("logo").unwrap_or_default(),
        author: meta.text("author").unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
        website: meta.text("website").unwrap_or_default(),
        tags: meta.tags(),
        ports,
        volumes,
        environment,
        manifest: Some(manifest.clone()),
        id,
    })
}

pub fn to_manifest(template: &AppTemplate) -> Manifest {
    match &template.manifest {
        Some(manifest) => manifest.clone(),
        None => synthesize(template),
    }
}

/// Re-derives the views of a template from its manifest, keeping the
/// descriptions of entries that are still present.
pub fn reconcile(mut template: AppTemplate) -> Result<AppTemplate> {
    let Some(manifest) = &template.manifest else {
        return Ok(template);
    };
    let project = ComposeProject::from_manifest(manifest)?;
    let (ports, volumes, environment) = views(project.primary());

    template.ports = ports
        .into_iter()
        .map(|mut port| {
            if let Some(old) = template
                .ports
                .iter()
                .find(|old| old.host == port.host && old.container == port.container)
            {
                port.description = old.description.clone();
            }
            port
        })
        .collect();
    template.volumes = volumes
        .into_iter()
        .map(|mut volume| {
            if let Some(old) = template
                .volumes
                .iter()
                .find(|old| old.host == volume.host && old.container == volume.container)
            {
                volume.description = old.description.clone();
            }
            volume
        })
        .collect();
    template.environment = environment
        .into_iter()
        .map(|mut var| {
            if let Some(old) = template.environment.iter().find(|old| old.name == var.name) {
                var.description = old.description.clone();
            }
            var
        })
        .collect();
    Ok(template)
}

pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if c == '_' {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches(|c| c == '-' || c == '_');
    slug.chars().take(64).collect::<String>().trim_end_matches('-').to_string()
}

fn views(service: &ServiceSpec) -> (Vec<PortMapping>, Vec<VolumeMapping>, Vec<EnvVar>) {
    let ports = service
        .ports
        .iter()
        .map(|port| PortMapping {
            container: port.container,
            host: port.host,
            description: String::new(),
        })
        .collect();
    let volumes = service
        .volumes
        .iter()
        .map(|volume| VolumeMapping {
            container: volume.container.clone(),
            host: volume.host.clone(),
            description: String::new(),
        })
        .collect();
    let environment = service
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: value.clone(),
            description: String::new(),
        })
        .collect();
    (ports, volumes, environment)
}

/// Tag of an image reference, ignoring a registry port.
fn image_tag(image: &str) -> Option<String> {
    let image = image.split('@').next().unwrap_or(image);
    let last = image.rsplit('/').next().unwrap_or(image);
    last.split_once(':').map(|(_, tag)| tag.to_string())
}

fn synthesize(template: &AppTemplate) -> Manifest {
    let mut service = Mapping::new();
    let version = if template.version.is_empty() {
        DEFAULT_VERSION
    } else {
        template.version.as_str()
    };
    service.insert(
        Value::String("image".into()),
        Value::String(format!("{}:{}", template.id, version)),
    );
    if !template.ports.is_empty() {
        service.insert(
            Value::String("ports".into()),
            Value::Sequence(
                template
                    .ports
                    .iter()
                    .map(|p| Value::String(format!("{}:{}", p.host, p.container)))
                    .collect(),
            ),
        );
    }
    if !template.volumes.is_empty() {
        service.insert(
            Value::String("volumes".into()),
            Value::Sequence(
                template
                    .volumes
                    .iter()
                    .map(|v| Value::String(format!("{}:{}", v.host, v.container)))
                    .collect(),
            ),
        );
    }
    if !template.environment.is_empty() {
        service.insert(
            Value::String("environment".into()),
            Value::Sequence(
                template
                    .environment
                    .iter()
                    .map(|e| Value::String(format!("{}={}", e.name, e.value)))
                    .collect(),
            ),
        );
    }

    let mut services = Mapping::new();
    services.insert(Value::String(template.id.clone()), Value::Mapping(service));
    let mut root = Mapping::new();
    root.insert(Value::String("services".into()), Value::Mapping(services));
    Manifest::from_mapping(root)
}

struct Metadata<'a>(Option<&'a Mapping>);

impl<'a> Metadata<'a> {
    fn read(manifest: &'a Manifest) -> Self {
        Metadata(manifest.extension(METADATA_KEY))
    }

    fn text(&self, key: &str) -> Option<String> {
        self.0
            .and_then(|meta| meta.get(key))
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string)
    }

    fn tags(&self) -> BTreeSet<String> {
        self.0
            .and_then(|meta| meta.get("tags"))
            .and_then(Value::as_sequence)
            .map(|tags| tags.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }
}
