use crate::entities::{USER_ACTIVE, category, product, user};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter};
use std::collections::HashMap;
use tracing::info;

pub struct UserSeed {
    pub full_name: &'static str,
    pub email: &'static str,
    pub marketing_opt_in: bool,
}

pub struct ProductSeed {
    pub name: &'static str,
    pub sku: &'static str,
    pub price_cents: i64,
    pub inventory_count: i32,
    pub category: &'static str,
}

pub const KEYBOARD_SKU: &str = "KEY-001";
pub const LAPTOP_STAND_SKU: &str = "LAP-002";
pub const NOTEBOOK_SKU: &str = "NOTE-003";
pub const ANTHOLOGY_SKU: &str = "BOOK-004";

pub const FIXED_CATEGORIES: [&str; 4] = ["Electronics", "Books", "Accessories", "Education"];

pub const FIXED_USERS: [UserSeed; 4] = [
    UserSeed {
        full_name: "Ada Lovelace",
        email: "ada.lovelace@example.com",
        marketing_opt_in: true,
    },
    UserSeed {
        full_name: "Grace Hopper",
        email: "grace.hopper@example.com",
        marketing_opt_in: true,
    },
    UserSeed {
        full_name: "Hedy Lamarr",
        email: "hedy.lamarr@example.com",
        marketing_opt_in: false,
    },
    UserSeed {
        full_name: "Katherine Johnson",
        email: "katherine.johnson@example.com",
        marketing_opt_in: true,
    },
];

pub const FIXED_PRODUCTS: [ProductSeed; 4] = [
    ProductSeed {
        name: "Mechanical Keyboard",
        sku: KEYBOARD_SKU,
        price_cents: 18_999,
        inventory_count: 35,
        category: "Electronics",
    },
    ProductSeed {
        name: "Aluminum Laptop Stand",
        sku: LAPTOP_STAND_SKU,
        price_cents: 7_950,
        inventory_count: 58,
        category: "Accessories",
    },
    ProductSeed {
        name: "Grid Notebook",
        sku: NOTEBOOK_SKU,
        price_cents: 1_200,
        inventory_count: 150,
        category: "Accessories",
    },
    ProductSeed {
        name: "Algorithms Anthology",
        sku: ANTHOLOGY_SKU,
        price_cents: 5_495,
        inventory_count: 42,
        category: "Books",
    },
];

/// Rows inserted by one [`seed_database`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub categories: usize,
    pub users: usize,
    pub products: usize,
}

/// Inserts the fixed categories, users and products.
///
/// Rows whose unique key already exists are left untouched, so seeding a
/// shared database twice is harmless.
pub async fn seed_database<C: ConnectionTrait>(db: &C) -> Result<SeedSummary, DbErr> {
    let mut summary = SeedSummary::default();

    let mut categories = HashMap::new();
    for name in FIXED_CATEGORIES {
        let existing = category::Entity::find()
            .filter(category::Column::Name.eq(name))
            .one(db)
            .await?;
        let model = match existing {
            Some(model) => model,
            None => {
                summary.categories += 1;
                category::ActiveModel {
                    name: Set(name.to_string()),
                    ..Default::default()
                }
                .insert(db)
                .await?
            }
        };
        categories.insert(name, model.id);
    }

    let now = Utc::now().naive_utc();
    for seed in &FIXED_USERS {
        let exists = user::Entity::find()
            .filter(user::Column::Email.eq(seed.email))
            .one(db)
            .await?
            .is_some();
        if exists {
            continue;
        }
        user::ActiveModel {
            full_name: Set(seed.full_name.to_string()),
            email: Set(seed.email.to_string()),
            status: Set(USER_ACTIVE.to_string()),
            marketing_opt_in: Set(seed.marketing_opt_in),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await?;
        summary.users += 1;
    }

    for seed in &FIXED_PRODUCTS {
        let exists = product::Entity::find()
            .filter(product::Column::Sku.eq(seed.sku))
            .one(db)
            .await?
            .is_some();
        if exists {
            continue;
        }
        let category_id = categories
            .get(seed.category)
            .copied()
            .ok_or_else(|| DbErr::Custom(format!("Unknown seed category: {}", seed.category)))?;
        product::ActiveModel {
            name: Set(seed.name.to_string()),
            sku: Set(seed.sku.to_string()),
            price_cents: Set(seed.price_cents),
            inventory_count: Set(seed.inventory_count),
            category_id: Set(category_id),
            ..Default::default()
        }
        .insert(db)
        .await?;
        summary.products += 1;
    }

    info!(
        "Seeded {} categories, {} users and {} products",
        summary.categories, summary.users, summary.products
    );
    Ok(summary)
}
