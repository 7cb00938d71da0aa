//! Filtered machine search.
//!
//! Everything here is backend-agnostic except the hardware JSON accessor,
//! which is the one query fragment the two dialects spell differently.

use entity::machine::{self, MachineStatus};
use sea_orm::sea_query::{Condition, Expr, ExprTrait, Func, SimpleExpr};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MachineFilter {
    pub status: Option<String>,
    pub hostname: Option<String>,
    pub service_tag: Option<String>,
    pub mac_address: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    /// OR across hostname, service_tag, mac_address, description.
    pub search: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl MachineFilter {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.hostname.is_none()
            && self.service_tag.is_none()
            && self.mac_address.is_none()
            && self.manufacturer.is_none()
            && self.model.is_none()
            && self.search.is_none()
            && self.limit.is_none()
            && self.offset.is_none()
    }
}

/// Case-insensitive substring match on a plain column.
fn contains(column: machine::Column, term: &str) -> SimpleExpr {
    Expr::expr(Func::lower(Expr::col(column))).like(format!("%{}%", term.to_lowercase()))
}

/// Case-insensitive substring match on a top-level hardware field. The
/// JSON accessor is the dialect-specific part: `->>` on PostgreSQL,
/// `json_extract` on SQLite.
fn hardware_contains(backend: DbBackend, field: &str, term: &str) -> SimpleExpr {
    let pattern = format!("%{}%", term.to_lowercase());
    match backend {
        DbBackend::Postgres => Expr::cust_with_values(
            format!("LOWER(hardware ->> '{field}') LIKE ?"),
            [pattern],
        ),
        _ => Expr::cust_with_values(
            format!("LOWER(json_extract(hardware, '$.{field}')) LIKE ?"),
            [pattern],
        ),
    }
}

pub async fn search_machines(
    db: &DatabaseConnection,
    filter: &MachineFilter,
) -> Result<Vec<machine::Model>, DbErr> {
    let backend = db.get_database_backend();
    let mut query = machine::Entity::find();

    if let Some(status) = &filter.status {
        match MachineStatus::parse(status) {
            Some(status) => query = query.filter(machine::Column::Status.eq(status)),
            // An unknown status value matches no machines.
            None => return Ok(Vec::new()),
        }
    }
    if let Some(hostname) = &filter.hostname {
        query = query.filter(contains(machine::Column::Hostname, hostname));
    }
    if let Some(service_tag) = &filter.service_tag {
        query = query.filter(contains(machine::Column::ServiceTag, service_tag));
    }
    if let Some(mac_address) = &filter.mac_address {
        query = query.filter(contains(machine::Column::MacAddress, mac_address));
    }
    if let Some(manufacturer) = &filter.manufacturer {
        query = query.filter(hardware_contains(backend, "manufacturer", manufacturer));
    }
    if let Some(model) = &filter.model {
        query = query.filter(hardware_contains(backend, "model", model));
    }
    if let Some(term) = &filter.search {
        query = query.filter(
            Condition::any()
                .add(contains(machine::Column::Hostname, term))
                .add(contains(machine::Column::ServiceTag, term))
                .add(contains(machine::Column::MacAddress, term))
                .add(contains(machine::Column::Description, term)),
        );
    }

    query = query.order_by_desc(machine::Column::EnrolledAt);
    if let Some(limit) = filter.limit {
        query = query.limit(limit);
    }
    if let Some(offset) = filter.offset {
        query = query.offset(offset);
    }

    query.all(db).await
}
