use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docrules_core::config::CoreConfig;
use docrules_core::db::DatabasePool;
use docrules_protocol::document::FieldStore;
use serde_json::{Map, Value};
use sqlx::FromRow;
use tracing::debug;

use crate::error::RuleError;
use crate::link::{TenantLinks, TenantRuleLink};
use crate::lookup::{ReferenceSource, ReferenceTable};
use crate::rule::Rule;
use crate::ruleset::RuleCatalog;
use crate::source::RuleSource;

/// Postgres-backed rule source over `reglas_negocio`,
/// `tenant_reglas_globales` and `parametros_maestros`.
#[derive(Clone)]
pub struct PgRuleRepository {
    pool: DatabasePool,
}

impl PgRuleRepository {
    pub async fn from_config(config: &CoreConfig) -> Result<Self, RuleError> {
        let pool = DatabasePool::connect(config).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Global rules plus the tenant's own, ordered like the engine orders
    /// them. Inactive rows are kept so callers see the full catalog.
    pub async fn fetch_rules(&self, tenant: &str) -> Result<Vec<Rule>, RuleError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT
                id, codigo, nombre, descripcion, tipo, prioridad, activa,
                "tenantId" AS tenant_id, configuracion,
                "fechaVigencia" AS fecha_vigencia
            FROM reglas_negocio
            WHERE ("tenantId" IS NULL OR "tenantId" = $1)
              AND tipo IN ('EXTRACCION', 'TRANSFORMACION', 'TRANSFORMACION_DOCUMENTO', 'VALIDACION')
            ORDER BY prioridad ASC, "createdAt" ASC
            "#,
        )
        .bind(tenant)
        .fetch_all(self.pool.inner())
        .await?;

        rows.into_iter().map(Rule::try_from).collect()
    }

    /// Every rule and link row, used to seed an in-memory store.
    pub async fn load_catalog(&self) -> Result<RuleCatalog, RuleError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT
                id, codigo, nombre, descripcion, tipo, prioridad, activa,
                "tenantId" AS tenant_id, configuracion,
                "fechaVigencia" AS fecha_vigencia
            FROM reglas_negocio
            WHERE tipo IN ('EXTRACCION', 'TRANSFORMACION', 'TRANSFORMACION_DOCUMENTO', 'VALIDACION')
            ORDER BY prioridad ASC, "createdAt" ASC
            "#,
        )
        .fetch_all(self.pool.inner())
        .await?;
        let rules = rows
            .into_iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let links = sqlx::query_as::<_, LinkRow>(
            r#"
            SELECT l."tenantId" AS tenant_id, r.codigo, l.activa,
                   l."updatedAt" AS updated_at
            FROM tenant_reglas_globales l
            JOIN reglas_negocio r ON r.id = l."reglaId"
            WHERE r."tenantId" IS NULL
            "#,
        )
        .fetch_all(self.pool.inner())
        .await?;

        RuleCatalog::new(rules, links.into_iter().map(TenantRuleLink::from).collect())
    }

    pub async fn fetch_links(&self, tenant: &str) -> Result<TenantLinks, RuleError> {
        let rows = sqlx::query_as::<_, LinkRow>(
            r#"
            SELECT l."tenantId" AS tenant_id, r.codigo, l.activa,
                   l."updatedAt" AS updated_at
            FROM tenant_reglas_globales l
            JOIN reglas_negocio r ON r.id = l."reglaId"
            WHERE l."tenantId" = $1 AND r."tenantId" IS NULL
            "#,
        )
        .bind(tenant)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows.into_iter().map(TenantRuleLink::from).collect())
    }

    /// Upserts the link row enabling or disabling a global rule.
    pub async fn set_link(&self, tenant: &str, code: &str, active: bool) -> Result<TenantRuleLink, RuleError> {
        let rule_id: Option<String> = sqlx::query_scalar(
            r#"SELECT id FROM reglas_negocio WHERE codigo = $1 AND "tenantId" IS NULL"#,
        )
        .bind(code)
        .fetch_optional(self.pool.inner())
        .await?;
        let rule_id = rule_id.ok_or_else(|| RuleError::NotGlobal(code.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tenant_reglas_globales ("tenantId", "reglaId", activa, "updatedAt")
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT ("tenantId", "reglaId")
            DO UPDATE SET activa = EXCLUDED.activa, "updatedAt" = NOW()
            "#,
        )
        .bind(tenant)
        .bind(&rule_id)
        .bind(active)
        .execute(self.pool.inner())
        .await?;

        Ok(TenantRuleLink::new(tenant, code, active))
    }
}

#[async_trait]
impl RuleSource for PgRuleRepository {
    async fn fetch_catalog(&self, tenant: &str) -> Result<RuleCatalog, RuleError> {
        let rules = self.fetch_rules(tenant).await?;
        let links = self.fetch_links(tenant).await?;
        debug!(tenant = %tenant, rules = rules.len(), links = links.len(), "fetched rule catalog");
        RuleCatalog::new(rules, links)
    }
}

#[async_trait]
impl ReferenceSource for PgRuleRepository {
    async fn fetch_table(&self, _tenant: &str, name: &str) -> Result<Option<ReferenceTable>, RuleError> {
        let rows = sqlx::query_as::<_, ParameterRow>(
            r#"
            SELECT codigo, nombre, valor_padre, parametros_json
            FROM parametros_maestros
            WHERE tipo_campo = $1 AND activo = true
            ORDER BY codigo ASC
            "#,
        )
        .bind(name)
        .fetch_all(self.pool.inner())
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(ReferenceTable::new(
            name,
            rows.into_iter().map(ParameterRow::into_store).collect(),
        )))
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    id: String,
    codigo: String,
    nombre: String,
    descripcion: Option<String>,
    tipo: String,
    prioridad: i32,
    activa: bool,
    tenant_id: Option<String>,
    configuracion: Value,
    fecha_vigencia: Option<DateTime<Utc>>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = RuleError;

    /// Columns override keys of the `configuracion` JSON.
    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let mut spec = match row.configuracion {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(RuleError::invalid(format!(
                    "rule `{}`: configuracion must be a JSON object",
                    row.codigo
                )))
            }
        };
        spec.insert("id".into(), Value::String(row.id));
        spec.insert("codigo".into(), Value::String(row.codigo.clone()));
        spec.insert("nombre".into(), Value::String(row.nombre));
        if let Some(descripcion) = row.descripcion {
            spec.insert("descripcion".into(), Value::String(descripcion));
        }
        spec.insert("tipo".into(), Value::String(row.tipo));
        spec.insert("prioridad".into(), Value::from(row.prioridad));
        spec.insert("activa".into(), Value::Bool(row.activa));
        spec.insert(
            "tenantId".into(),
            row.tenant_id.map(Value::String).unwrap_or(Value::Null),
        );
        if let Some(fecha) = row.fecha_vigencia {
            spec.insert("fechaVigencia".into(), Value::String(fecha.to_rfc3339()));
        }

        serde_json::from_value(Value::Object(spec))
            .map_err(|err| RuleError::invalid(format!("rule `{}`: {}", row.codigo, err)))
    }
}

#[derive(Debug, FromRow)]
struct LinkRow {
    tenant_id: String,
    codigo: String,
    activa: bool,
    updated_at: Option<DateTime<Utc>>,
}

impl From<LinkRow> for TenantRuleLink {
    fn from(row: LinkRow) -> Self {
        TenantRuleLink {
            tenant_id: row.tenant_id,
            rule_code: row.codigo,
            active: row.activa,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ParameterRow {
    codigo: String,
    nombre: Option<String>,
    valor_padre: Option<String>,
    parametros_json: Option<Value>,
}

impl ParameterRow {
    /// Row columns plus the keys of `parametros_json`, which never shadow
    /// the columns.
    fn into_store(self) -> FieldStore {
        let mut row = match self.parametros_json {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        row.insert("codigo".into(), Value::String(self.codigo));
        if let Some(nombre) = self.nombre {
            row.insert("nombre".into(), Value::String(nombre));
        }
        if let Some(padre) = self.valor_padre {
            row.insert("valor_padre".into(), Value::String(padre));
        }
        FieldStore::from_json_object(&row)
    }
}
