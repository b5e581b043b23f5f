#![allow(dead_code)]

pub mod widget;

use common::test_helpers::{connect_in_memory, init_test_tracing};
use sandbox::SandboxedConnection;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, Schema,
};

pub use common::test_helpers::{TestError, TestResult};

pub const SEEDED_WIDGETS: [(&str, &str, i32); 2] = [
    ("WID-001", "Sprocket", 35),
    ("WID-002", "Flange", 12),
];

pub async fn create_widget_table<C: ConnectionTrait>(db: &C) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut statement = schema.create_table_from_entity(widget::Entity);
    statement.if_not_exists();
    db.execute(backend.build(&statement)).await?;
    Ok(())
}

pub async fn insert_widget<C: ConnectionTrait>(
    db: &C,
    sku: &str,
    stock: i32,
) -> Result<widget::Model, DbErr> {
    widget::ActiveModel {
        sku: Set(sku.to_string()),
        name: Set(format!("Widget {sku}")),
        stock: Set(stock),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn widget_count<C: ConnectionTrait>(db: &C) -> Result<u64, DbErr> {
    widget::Entity::find().count(db).await
}

pub async fn stock_of<C: ConnectionTrait>(db: &C, sku: &str) -> Result<Option<i32>, DbErr> {
    Ok(widget::Entity::find()
        .filter(widget::Column::Sku.eq(sku))
        .one(db)
        .await?
        .map(|widget| widget.stock))
}

/// In-memory SQLite with the widgets table and two seeded widgets.
pub async fn seeded_database() -> Result<DatabaseConnection, DbErr> {
    init_test_tracing();
    let db = connect_in_memory().await?;
    create_widget_table(&db).await?;
    for (sku, _, stock) in SEEDED_WIDGETS {
        insert_widget(&db, sku, stock).await?;
    }
    Ok(db)
}

pub async fn sandboxed_database() -> Result<SandboxedConnection, DbErr> {
    Ok(SandboxedConnection::new(seeded_database().await?))
}

pub fn widget_model(id: i32, sku: &str, stock: i32) -> widget::Model {
    widget::Model {
        id,
        sku: sku.to_string(),
        name: format!("Widget {sku}"),
        stock,
    }
}

/// A driver error that carries only a code, with a message that no conflict
/// keyword matches.
#[derive(Debug)]
pub struct CodedDatabaseError {
    code: String,
    message: String,
}

impl std::fmt::Display for CodedDatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CodedDatabaseError {}

impl sqlx::error::DatabaseError for CodedDatabaseError {
    fn message(&self) -> &str {
        &self.message
    }

    fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
        Some(std::borrow::Cow::Borrowed(&self.code))
    }

    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        sqlx::error::ErrorKind::Other
    }
}

/// `DbErr::Exec` wrapping a sqlx database error with the given code.
pub fn coded_db_error(code: &str, message: &str) -> DbErr {
    DbErr::Exec(sea_orm::RuntimeErr::SqlxError(sqlx::Error::Database(Box::new(
        CodedDatabaseError {
            code: code.to_string(),
            message: message.to_string(),
        },
    ))))
}
