use crate::entities::{category, order, order_item, payment, product, user};
use sea_orm::sea_query::{Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DbErr, Schema};
use tracing::debug;

fn create_statements(schema: &Schema) -> Vec<TableCreateStatement> {
    vec![
        schema.create_table_from_entity(user::Entity),
        schema.create_table_from_entity(category::Entity),
        schema.create_table_from_entity(product::Entity),
        schema.create_table_from_entity(order::Entity),
        schema.create_table_from_entity(order_item::Entity),
        schema.create_table_from_entity(payment::Entity),
    ]
}

/// Creates every shop table that does not exist yet, parents before children.
pub async fn create_schema<C: ConnectionTrait>(db: &C) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    for mut statement in create_statements(&schema) {
        statement.if_not_exists();
        db.execute(backend.build(&statement)).await?;
    }
    debug!("Shop schema ready on {:?}", backend);
    Ok(())
}

/// Drops the shop tables, children first.
pub async fn drop_schema<C: ConnectionTrait>(db: &C) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let drops = [
        Table::drop().table(payment::Entity).if_exists().to_owned(),
        Table::drop().table(order_item::Entity).if_exists().to_owned(),
        Table::drop().table(order::Entity).if_exists().to_owned(),
        Table::drop().table(product::Entity).if_exists().to_owned(),
        Table::drop().table(category::Entity).if_exists().to_owned(),
        Table::drop().table(user::Entity).if_exists().to_owned(),
    ];

    for statement in drops {
        db.execute(backend.build(&statement)).await?;
    }
    Ok(())
}
