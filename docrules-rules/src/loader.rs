use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::RuleError;
use crate::link::{TenantLinks, TenantRuleLink};
use crate::rule::Rule;
use crate::ruleset::{ensure_unique_codes, RuleCatalog};

/// Loads every rule under `path` (a file, or a directory of YAML/JSON
/// files). Codes must be unique within each namespace.
pub fn load_rules(path: impl AsRef<Path>) -> Result<Vec<Rule>, RuleError> {
    Ok(load_catalog(path)?.rules().to_vec())
}

/// Loads rules and tenant links under `path` into a catalog.
pub fn load_catalog(path: impl AsRef<Path>) -> Result<RuleCatalog, RuleError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(RuleError::MissingPath(path.display().to_string()));
    }

    let mut bundle = if path.is_dir() {
        load_from_directory(path)?
    } else {
        load_from_file(path)?
    };

    ensure_unique_codes(&bundle.rules)?;
    bundle.rules.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.code.cmp(&b.code))
    });
    debug!(
        path = %path.display(),
        rules = bundle.rules.len(),
        links = bundle.links.len(),
        "loaded rule catalog"
    );

    RuleCatalog::new(bundle.rules, bundle.links.into_iter().collect::<TenantLinks>())
}

#[derive(Debug, Default)]
struct Bundle {
    rules: Vec<Rule>,
    links: Vec<TenantRuleLink>,
}

fn load_from_directory(path: &Path) -> Result<Bundle, RuleError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).map_err(|err| RuleError::from_io(path, err))? {
        let entry = entry.map_err(|err| RuleError::from_io(path, err))?;
        let file_type = entry
            .file_type()
            .map_err(|err| RuleError::from_io(entry.path(), err))?;
        if file_type.is_dir() {
            continue;
        }
        entries.push(entry.path());
    }
    // read_dir order is platform dependent
    entries.sort();

    let mut bundle = Bundle::default();
    for file in entries {
        if let Some(ext) = file.extension().and_then(|value| value.to_str()) {
            if matches!(ext, "json" | "yaml" | "yml") {
                let mut loaded = load_from_file(&file)?;
                bundle.rules.append(&mut loaded.rules);
                bundle.links.append(&mut loaded.links);
            }
        }
    }

    Ok(bundle)
}

fn load_from_file(path: &Path) -> Result<Bundle, RuleError> {
    let raw = fs::read_to_string(path).map_err(|err| RuleError::from_io(path, err))?;
    parse_rules(&raw, path)
}

/// Accepts a `{rules, links}` document, a list of rules or a single rule.
/// YAML parsing covers JSON input as well.
fn parse_rules(raw: &str, path: &Path) -> Result<Bundle, RuleError> {
    let value: serde_yaml::Value = serde_yaml::from_str(raw)
        .map_err(|err| RuleError::parse_error(path, err.to_string()))?;

    let is_document = value
        .as_mapping()
        .map(|map| map.contains_key("rules") || map.contains_key("reglas"))
        .unwrap_or(false);

    if is_document {
        let doc: RuleDocument = serde_yaml::from_value(value)
            .map_err(|err| RuleError::parse_error(path, err.to_string()))?;
        return Ok(Bundle {
            rules: doc.rules,
            links: doc.links,
        });
    }

    if value.is_sequence() {
        let rules: Vec<Rule> = serde_yaml::from_value(value)
            .map_err(|err| RuleError::parse_error(path, err.to_string()))?;
        return Ok(Bundle {
            rules,
            links: Vec::new(),
        });
    }

    let rule: Rule = serde_yaml::from_value(value)
        .map_err(|err| RuleError::parse_error(path, err.to_string()))?;
    Ok(Bundle {
        rules: vec![rule],
        links: Vec::new(),
    })
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    #[serde(alias = "reglas")]
    rules: Vec<Rule>,
    #[serde(default, alias = "vinculos")]
    links: Vec<TenantRuleLink>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use tempfile::tempdir;

    const YAML_DOCUMENT: &str = r#"
rules:
  - codigo: CUIT_CEROS
    tipo: TRANSFORMACION
    prioridad: 10
    acciones:
      - operacion: REMOVE_LEADING_ZEROS
        campo: cuit
  - codigo: BANDEJAS
    tipo: TRANSFORMACION
    tenantId: tenant-a
    prioridad: 5
    aplicaA: LINEAS
    condiciones:
      - campo: descripcion
        operador: CONTAINS
        valor: bandeja
    acciones:
      - operacion: SET_VALUE
        campo: codigoProducto
        valor: BAND-01
links:
  - tenantId: tenant-a
    codigo: CUIT_CEROS
    activa: true
"#;

    #[test]
    fn loads_yaml_document_with_links() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("reglas.yaml");
        fs::write(&file, YAML_DOCUMENT).expect("write");

        let catalog = load_catalog(&file).expect("catalog");
        let codes: Vec<_> = catalog.rules().iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["BANDEJAS", "CUIT_CEROS"]);
        assert_eq!(
            catalog.links().state("tenant-a", "CUIT_CEROS"),
            LinkState::ExplicitlyEnabled
        );
    }

    #[test]
    fn loads_directory_of_json_and_yaml() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("a.json"),
            r#"[{"codigo": "A", "tipo": "EXTRACCION"}]"#,
        )
        .expect("write");
        fs::write(
            dir.path().join("b.yml"),
            "codigo: B\ntipo: VALIDACION\ncondiciones:\n  - campo: x\n    operador: IS_NOT_NULL\n",
        )
        .expect("write");
        fs::write(dir.path().join("readme.md"), "ignored").expect("write");

        let rules = load_rules(dir.path()).expect("rules");
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn rejects_duplicates_across_files() {
        let dir = tempdir().expect("tempdir");
        for name in ["a.json", "b.json"] {
            fs::write(
                dir.path().join(name),
                r#"{"codigo": "DUP", "tipo": "EXTRACCION"}"#,
            )
            .expect("write");
        }
        assert!(matches!(
            load_rules(dir.path()),
            Err(RuleError::DuplicateRule { .. })
        ));
    }

    #[test]
    fn malformed_rule_fails_to_load() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("mala.json");
        fs::write(
            &file,
            r#"{"codigo": "M", "tipo": "TRANSFORMACION", "condiciones": [{"campo": "x", "operador": "REGEX", "valor": "("}]}"#,
        )
        .expect("write");

        let err = load_rules(&file).expect_err("must fail");
        assert!(matches!(err, RuleError::Parse { .. }));
        assert!(err.to_string().contains("mala.json"));
    }

    #[test]
    fn missing_path_is_reported() {
        assert!(matches!(
            load_rules("/definitely/not/here"),
            Err(RuleError::MissingPath(_))
        ));
    }
}
