//! Idempotent PostgreSQL schema for the commerce core.
//!
//! Applied at startup. Every statement is `IF NOT EXISTS` so repeated
//! startups are safe; migrations beyond that are an ops concern.

use sqlx::PgPool;

/// Initialize all tables used by the commerce core.
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Initializing PostgreSQL schema...");

    for ddl in ALL_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!("PostgreSQL schema initialized");
    Ok(())
}

const ALL_TABLES: &[&str] = &[
    CREATE_PRODUCTS,
    CREATE_PRODUCT_SKUS,
    CREATE_ORDERS,
    CREATE_ORDER_ITEMS,
    CREATE_PAYMENTS,
    CREATE_PAYMENT_REFUNDS,
    CREATE_PAYMENT_LOGS,
    CREATE_PAYMENT_CONFIGS,
    CREATE_USER_WALLETS,
    CREATE_SYNC_DEAD_LETTERS,
];

const CREATE_PRODUCTS: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL,
    price       NUMERIC(18,2) NOT NULL,
    stock       BIGINT NOT NULL DEFAULT 0 CHECK (stock >= 0),
    sold_count  BIGINT NOT NULL DEFAULT 0,
    version     BIGINT NOT NULL DEFAULT 0,
    status      SMALLINT NOT NULL DEFAULT 1,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_PRODUCT_SKUS: &str = r#"
CREATE TABLE IF NOT EXISTS product_skus (
    id          BIGSERIAL PRIMARY KEY,
    product_id  BIGINT NOT NULL REFERENCES products(id),
    price       NUMERIC(18,2) NOT NULL,
    stock       BIGINT NOT NULL DEFAULT 0 CHECK (stock >= 0),
    version     BIGINT NOT NULL DEFAULT 0,
    status      SMALLINT NOT NULL DEFAULT 1,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ORDERS: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id              BIGSERIAL PRIMARY KEY,
    order_no        TEXT NOT NULL UNIQUE,
    user_id         BIGINT NOT NULL,
    total_amount    NUMERIC(18,2) NOT NULL,
    status          SMALLINT NOT NULL DEFAULT 0,
    payment_status  SMALLINT NOT NULL DEFAULT 0,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ORDER_ITEMS: &str = r#"
CREATE TABLE IF NOT EXISTS order_items (
    id          BIGSERIAL PRIMARY KEY,
    order_id    BIGINT NOT NULL REFERENCES orders(id),
    product_id  BIGINT NOT NULL,
    sku_id      BIGINT,
    quantity    BIGINT NOT NULL CHECK (quantity > 0),
    price       NUMERIC(18,2) NOT NULL
)
"#;

const CREATE_PAYMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS payments (
    id              BIGSERIAL PRIMARY KEY,
    payment_no      TEXT NOT NULL UNIQUE,
    order_id        BIGINT NOT NULL REFERENCES orders(id),
    user_id         BIGINT NOT NULL,
    method          SMALLINT NOT NULL,
    status          SMALLINT NOT NULL DEFAULT 0,
    amount          NUMERIC(18,2) NOT NULL,
    actual_amount   NUMERIC(18,2),
    third_party_id  TEXT,
    expired_at      TIMESTAMPTZ NOT NULL,
    paid_at         TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_PAYMENT_REFUNDS: &str = r#"
CREATE TABLE IF NOT EXISTS payment_refunds (
    id              BIGSERIAL PRIMARY KEY,
    refund_no       TEXT NOT NULL UNIQUE,
    payment_id      BIGINT NOT NULL REFERENCES payments(id),
    refund_amount   NUMERIC(18,2) NOT NULL CHECK (refund_amount > 0),
    status          SMALLINT NOT NULL DEFAULT 0,
    reason          TEXT,
    refunded_at     TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_PAYMENT_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS payment_logs (
    id          BIGSERIAL PRIMARY KEY,
    payment_id  BIGINT NOT NULL,
    payment_no  TEXT NOT NULL,
    from_status SMALLINT NOT NULL,
    to_status   SMALLINT NOT NULL,
    actor       TEXT NOT NULL,
    note        TEXT,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_PAYMENT_CONFIGS: &str = r#"
CREATE TABLE IF NOT EXISTS payment_configs (
    method            SMALLINT PRIMARY KEY,
    enabled           BOOLEAN NOT NULL DEFAULT TRUE,
    display_name      TEXT NOT NULL,
    min_amount        NUMERIC(18,2) NOT NULL,
    max_amount        NUMERIC(18,2) NOT NULL,
    daily_max_amount  NUMERIC(18,2) NOT NULL,
    daily_max_count   BIGINT NOT NULL,
    credentials       TEXT,
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_USER_WALLETS: &str = r#"
CREATE TABLE IF NOT EXISTS user_wallets (
    user_id     BIGINT PRIMARY KEY,
    balance     NUMERIC(18,2) NOT NULL DEFAULT 0 CHECK (balance >= 0),
    version     BIGINT NOT NULL DEFAULT 0,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_SYNC_DEAD_LETTERS: &str = r#"
CREATE TABLE IF NOT EXISTS sync_dead_letters (
    id          BIGSERIAL PRIMARY KEY,
    event_type  TEXT NOT NULL,
    payment_id  BIGINT NOT NULL,
    order_id    BIGINT NOT NULL,
    user_id     BIGINT NOT NULL,
    payload     TEXT NOT NULL,
    retry_count INT NOT NULL,
    error       TEXT,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;
