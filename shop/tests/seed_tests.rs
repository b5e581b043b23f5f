mod test_utils;

use sandbox::TestSandbox;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use shop::entities::{USER_ACTIVE, category, product, user};
use shop::seeds::{FIXED_CATEGORIES, FIXED_PRODUCTS, FIXED_USERS, KEYBOARD_SKU};
use shop::{SeedSummary, create_schema, drop_schema, seed_database};
use test_utils::{TestError, TestResult, sandboxed_shop, seeded_shop};

#[tokio::test]
async fn test_seeding_twice_inserts_nothing_new() -> TestResult {
    let db = seeded_shop().await?;

    let again = seed_database(&db).await?;
    assert_eq!(again, SeedSummary::default());
    assert_eq!(user::Entity::find().count(&db).await?, FIXED_USERS.len() as u64);
    assert_eq!(
        category::Entity::find().count(&db).await?,
        FIXED_CATEGORIES.len() as u64
    );
    assert_eq!(
        product::Entity::find().count(&db).await?,
        FIXED_PRODUCTS.len() as u64
    );
    Ok(())
}

#[tokio::test]
async fn test_seeded_rows_match_the_fixed_data() -> TestResult {
    let db = seeded_shop().await?;

    let keyboard = product::Entity::find()
        .filter(product::Column::Sku.eq(KEYBOARD_SKU))
        .one(&db)
        .await?
        .ok_or_else(|| TestError::assertion_failure("keyboard missing"))?;
    assert_eq!(keyboard.inventory_count, 35);
    assert_eq!(keyboard.price_cents, 18_999);

    let electronics = category::Entity::find_by_id(keyboard.category_id)
        .one(&db)
        .await?
        .ok_or_else(|| TestError::assertion_failure("category missing"))?;
    assert_eq!(electronics.name, "Electronics");

    let hedy = user::Entity::find()
        .filter(user::Column::Email.eq("hedy.lamarr@example.com"))
        .one(&db)
        .await?
        .ok_or_else(|| TestError::assertion_failure("user missing"))?;
    assert!(!hedy.marketing_opt_in);
    assert_eq!(hedy.status, USER_ACTIVE);
    Ok(())
}

#[tokio::test]
async fn test_seeding_inside_a_sandbox_leaves_no_trace() -> TestResult {
    let connection = sandboxed_shop().await?;
    drop_schema(connection.original()).await?;
    create_schema(connection.original()).await?;

    let sandbox = TestSandbox::new(&connection);
    sandbox.init().await?;
    let summary = seed_database(&connection.handle()).await?;
    assert_eq!(summary.products, FIXED_PRODUCTS.len());
    sandbox.finish().await?;

    assert_eq!(product::Entity::find().count(connection.original()).await?, 0);
    assert_eq!(user::Entity::find().count(connection.original()).await?, 0);
    Ok(())
}
