#![allow(dead_code)]

use common::test_helpers::{connect_in_memory, init_test_tracing};
use sandbox::{HookRegistry, SandboxOptions, SandboxedConnection, register_transactional_hooks};
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use shop::entities::product;
use shop::{create_schema, seed_database};

pub use common::test_helpers::{TestError, TestResult};

/// In-memory SQLite with the shop schema and the fixed seed data.
pub async fn seeded_shop() -> Result<DatabaseConnection, DbErr> {
    init_test_tracing();
    let db = connect_in_memory().await?;
    create_schema(&db).await?;
    seed_database(&db).await?;
    Ok(db)
}

pub async fn sandboxed_shop() -> Result<SandboxedConnection, DbErr> {
    Ok(SandboxedConnection::new(seeded_shop().await?))
}

pub fn hooked_registry(connection: &SandboxedConnection) -> HookRegistry {
    let mut registry = HookRegistry::new();
    register_transactional_hooks(connection, &mut registry, SandboxOptions::default());
    registry
}

pub async fn inventory_of<C: ConnectionTrait>(db: &C, sku: &str) -> Result<i32, DbErr> {
    product::Entity::find()
        .filter(product::Column::Sku.eq(sku))
        .one(db)
        .await?
        .map(|product| product.inventory_count)
        .ok_or_else(|| DbErr::RecordNotFound(format!("product {sku}")))
}
