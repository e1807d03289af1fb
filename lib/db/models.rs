use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::BigInt;

use super::schema::{user_orders, users};
use crate::ledger::{Balance, LedgerError, Order, OrderStatus, Points};

/// One `user_orders` row, loadable through the query DSL or raw `RETURNING` queries.
#[derive(Debug, Clone, Queryable, Selectable, QueryableByName)]
#[diesel(table_name = user_orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderRecord {
    pub id: i64,
    pub user_id: i64,
    pub order_number: String,
    pub status: String,
    pub points_awarded: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRecord> for Order {
    type Error = LedgerError;

    fn try_from(record: OrderRecord) -> Result<Self, Self::Error> {
        Ok(Order {
            id: record.id,
            user_id: record.user_id,
            number: record.order_number,
            status: OrderStatus::from_db_str(&record.status)?,
            points_awarded: record.points_awarded.map(Points::from_hundredths),
            created_at: record.created_at,
            processing_started_at: record.processing_started_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub login_name: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = user_orders)]
pub struct NewOrder<'a> {
    pub user_id: i64,
    pub order_number: &'a str,
}

#[derive(Debug, QueryableByName)]
pub struct BalanceRow {
    #[diesel(sql_type = BigInt)]
    pub balance: i64,
    #[diesel(sql_type = BigInt)]
    pub withdrawal: i64,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            current: Points::from_hundredths(row.balance),
            withdrawn: Points::from_hundredths(row.withdrawal),
        }
    }
}

#[derive(Debug, QueryableByName)]
pub struct UserIdRow {
    #[diesel(sql_type = BigInt)]
    pub user_id: i64,
}
