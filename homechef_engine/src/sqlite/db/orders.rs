use chrono::{DateTime, Duration, Utc};
use hc_common::Money;
use log::*;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    db_types::{
        CancellationPolicy,
        NewOrder,
        NewOrderItem,
        Order,
        OrderId,
        OrderItem,
        OrderStatusType,
        PaymentStatus,
        StatusHistoryEntry,
    },
    lifecycle::OrderChanges,
};

/// Inserts a new order in the `payment_confirmed` state. This is not atomic on its own; items and the first history
/// entry are written by the caller in the same transaction.
///
/// `subtotal` and `total` are computed by the caller, which is responsible for rejecting orders whose sums overflow.
#[allow(clippy::too_many_arguments)]
pub async fn insert_order(
    customer_id: &str,
    order: &NewOrder,
    subtotal: Money,
    total: Money,
    policy: &CancellationPolicy,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Order, sqlx::Error> {
    let countdown_expiry = now + Duration::seconds(policy.free_window_seconds);
    let order = sqlx::query_as(
        r#"
            INSERT INTO orders (
                customer_id,
                chef_id,
                subtotal,
                delivery_fee,
                tax_amount,
                total_amount,
                payment_id,
                payment_status,
                status,
                policy_id,
                countdown_expiry,
                can_cancel_free,
                special_instructions,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING *;
        "#,
    )
    .bind(customer_id)
    .bind(&order.chef_id)
    .bind(subtotal)
    .bind(order.delivery_fee)
    .bind(order.tax_amount)
    .bind(total)
    .bind(&order.payment_id)
    .bind(PaymentStatus::Authorized)
    .bind(OrderStatusType::PaymentConfirmed)
    .bind(policy.id)
    .bind(countdown_expiry)
    .bind(policy.free_window_seconds > 0)
    .bind(&order.special_instructions)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(order)
}

pub async fn insert_items(
    order_id: OrderId,
    items: &[NewOrderItem],
    conn: &mut SqliteConnection,
) -> Result<(), sqlx::Error> {
    if items.is_empty() {
        return Ok(());
    }
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO order_items (order_id, dish_id, quantity, unit_price, instructions) ");
    builder.push_values(items, |mut b, item| {
        b.push_bind(order_id)
            .push_bind(&item.dish_id)
            .push_bind(item.quantity)
            .push_bind(item.unit_price)
            .push_bind(&item.instructions);
    });
    builder.build().execute(conn).await?;
    trace!("🗃️ {} items saved for order {order_id}", items.len());
    Ok(())
}

pub async fn fetch_order(id: OrderId, conn: &mut SqliteConnection) -> Result<Option<Order>, sqlx::Error> {
    let order = sqlx::query_as("SELECT * FROM orders WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(order)
}

pub async fn fetch_items(id: OrderId, conn: &mut SqliteConnection) -> Result<Vec<OrderItem>, sqlx::Error> {
    let items =
        sqlx::query_as("SELECT * FROM order_items WHERE order_id = $1 ORDER BY id").bind(id).fetch_all(conn).await?;
    Ok(items)
}

pub async fn fetch_history(id: OrderId, conn: &mut SqliteConnection) -> Result<Vec<StatusHistoryEntry>, sqlx::Error> {
    let history = sqlx::query_as("SELECT * FROM status_history WHERE order_id = $1 ORDER BY id")
        .bind(id)
        .fetch_all(conn)
        .await?;
    Ok(history)
}

pub async fn append_history(
    id: OrderId,
    status: OrderStatusType,
    message: &str,
    actor: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO status_history (order_id, status, message, actor, created_at) VALUES ($1, $2, $3, $4, $5)")
        .bind(id)
        .bind(status)
        .bind(message)
        .bind(actor)
        .bind(now)
        .execute(conn)
        .await?;
    Ok(())
}

/// Compare-and-swap update of an order.
///
/// The row is only updated if it still has the status and `event_seq` of `expected`. Every successful update
/// increments `event_seq`. Returns `None` if the row had moved on.
pub async fn apply_changes(
    expected: &Order,
    to: OrderStatusType,
    changes: &OrderChanges,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<Order>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE orders SET status = ");
    builder.push_bind(to);
    builder.push(", event_seq = event_seq + 1, updated_at = ");
    builder.push_bind(now);
    macro_rules! set_if_some {
        ($($field:ident),+ $(,)?) => {
            $(
                if let Some(value) = &changes.$field {
                    builder.push(concat!(", ", stringify!($field), " = "));
                    builder.push_bind(value.clone());
                }
            )+
        };
    }
    set_if_some!(
        can_cancel_free,
        penalty_amount,
        refund_amount,
        payment_status,
        cancellation_type,
        cancellation_reason,
        decline_reason,
        estimated_prep_minutes,
        delivery_partner_id,
        delivery_proof,
        sent_to_chef_at,
        chef_accepted_at,
        pickup_at,
        delivered_at,
        cancelled_at,
    );
    builder.push(" WHERE id = ");
    builder.push_bind(expected.id);
    builder.push(" AND status = ");
    builder.push_bind(expected.status);
    builder.push(" AND event_seq = ");
    builder.push_bind(expected.event_seq);
    builder.push(" RETURNING *");
    let order = builder.build_query_as::<Order>().fetch_optional(conn).await?;
    Ok(order)
}

/// Orders whose free-cancellation window has not been closed yet, earliest expiry first.
pub async fn fetch_open_countdowns(conn: &mut SqliteConnection) -> Result<Vec<Order>, sqlx::Error> {
    let orders = sqlx::query_as("SELECT * FROM orders WHERE can_cancel_free = 1 ORDER BY countdown_expiry, id")
        .fetch_all(conn)
        .await?;
    Ok(orders)
}

pub async fn update_payment_status(
    id: OrderId,
    expected: PaymentStatus,
    new_status: PaymentStatus,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<Order>, sqlx::Error> {
    let order = sqlx::query_as(
        r#"
            UPDATE orders SET payment_status = $1, event_seq = event_seq + 1, updated_at = $2
            WHERE id = $3 AND payment_status = $4
            RETURNING *;
        "#,
    )
    .bind(new_status)
    .bind(now)
    .bind(id)
    .bind(expected)
    .fetch_optional(conn)
    .await?;
    Ok(order)
}

/// Takes the order's write lock, as long as it is still in `status`. Returns false if the order has moved on.
pub async fn touch_if_status(
    id: OrderId,
    status: OrderStatusType,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE orders SET updated_at = $1 WHERE id = $2 AND status = $3")
        .bind(now)
        .bind(id)
        .bind(status)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Recomputes the order's tip total from its tips that have not failed. Optionally bumps `event_seq`.
pub async fn refresh_tip_total(
    id: OrderId,
    bump_seq: bool,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<Order>, sqlx::Error> {
    let order = sqlx::query_as(
        r#"
            UPDATE orders SET
                tip_amount = (SELECT COALESCE(SUM(amount), 0) FROM tips WHERE order_id = $1 AND status != 'failed'),
                event_seq = event_seq + $2,
                updated_at = $3
            WHERE id = $1
            RETURNING *;
        "#,
    )
    .bind(id)
    .bind(i64::from(bump_seq))
    .bind(now)
    .fetch_optional(conn)
    .await?;
    Ok(order)
}
