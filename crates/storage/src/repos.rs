use chrono::NaiveDateTime;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};

use crate::models::*;

/// Outcome of [`register_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInsert {
    Inserted,
    AlreadyPresent,
    /// `referred_by` names a user that is not stored.
    DanglingReferrer,
    /// A root was offered while a different root already exists.
    DuplicateRoot,
}

/// `%needle%` for ILIKE, with the pattern metacharacters escaped.
pub fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

// ─── User Writes ────────────────────────────────────────────────────────────

/// Insert a user and apply the registration counter increments in one
/// transaction.
///
/// The direct referrer gets `total_partners`, `total_team`, `daily_partners`
/// and `daily_team` bumped; every id in `ancestors` (referrer excluded) gets
/// `total_team` and `daily_team` bumped. Nothing is written unless the user
/// row is new.
pub async fn register_user(
    pool: &PgPool,
    user: &NewUser,
    ancestors: &[i64],
) -> Result<UserInsert, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let present: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM users WHERE user_id = $1")
        .bind(user.user_id)
        .fetch_optional(&mut *tx)
        .await?;
    if present.is_some() {
        tx.rollback().await?;
        return Ok(UserInsert::AlreadyPresent);
    }

    match user.referred_by {
        Some(referrer) => {
            // Row lock keeps the referrer from disappearing under us.
            let found: Option<(i64,)> =
                sqlx::query_as("SELECT user_id FROM users WHERE user_id = $1 FOR SHARE")
                    .bind(referrer)
                    .fetch_optional(&mut *tx)
                    .await?;
            if found.is_none() {
                tx.rollback().await?;
                return Ok(UserInsert::DanglingReferrer);
            }
        }
        None => {
            let owner: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM users WHERE is_owner")
                .fetch_optional(&mut *tx)
                .await?;
            if owner.is_some() {
                tx.rollback().await?;
                return Ok(UserInsert::DuplicateRoot);
            }
        }
    }

    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO users (user_id, wallet_address, full_name, referred_by, referrer_address, is_owner, registration_time)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT DO NOTHING
        RETURNING user_id
        "#,
    )
    .bind(user.user_id)
    .bind(&user.wallet_address)
    .bind(&user.full_name)
    .bind(user.referred_by)
    .bind(&user.referrer_address)
    .bind(user.referred_by.is_none())
    .bind(user.registration_time)
    .fetch_optional(&mut *tx)
    .await?;

    if inserted.is_none() {
        tx.rollback().await?;
        return Ok(UserInsert::AlreadyPresent);
    }

    if let Some(referrer) = user.referred_by {
        sqlx::query(
            r#"
            UPDATE users SET
                total_partners = total_partners + 1,
                total_team = total_team + 1,
                daily_partners = daily_partners + 1,
                daily_team = daily_team + 1,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(referrer)
        .execute(&mut *tx)
        .await?;

        if !ancestors.is_empty() {
            sqlx::query(
                r#"
                UPDATE users SET
                    total_team = total_team + 1,
                    daily_team = daily_team + 1,
                    updated_at = NOW()
                WHERE user_id = ANY($1)
                "#,
            )
            .bind(ancestors)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(UserInsert::Inserted)
}

/// Atomically add `delta` to each named counter. Returns false if the user is absent.
pub async fn increment_counters<'e, E>(
    executor: E,
    user_id: i64,
    deltas: &[(Counter, i64)],
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    if deltas.is_empty() {
        return Ok(true);
    }

    // Build: UPDATE users SET c = c + $n, ..., updated_at = NOW() WHERE user_id = $m
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE users SET ");
    for (counter, delta) in deltas {
        let column = counter.column();
        qb.push(column)
            .push(" = ")
            .push(column)
            .push(" + ")
            .push_bind(*delta)
            .push(", ");
    }
    qb.push("updated_at = NOW() WHERE user_id = ").push_bind(user_id);

    let result = qb.build().execute(executor).await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_current_active_slot(pool: &PgPool, user_id: i64, slot: i32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET current_active_slot = $1, updated_at = NOW() WHERE user_id = $2")
        .bind(slot)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Overwrite the cumulative income columns with a fresh chain reading.
pub async fn set_income(pool: &PgPool, user_id: i64, income: &Income) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE users SET
            income_total = $1,
            income_level = $2,
            income_direct = $3,
            income_slot = $4,
            income_recycle = $5,
            income_salary = $6,
            updated_at = NOW()
        WHERE user_id = $7
        "#,
    )
    .bind(&income.total)
    .bind(&income.level_income)
    .bind(&income.direct_income)
    .bind(&income.slot_income)
    .bind(&income.recycle_income)
    .bind(&income.salary_income)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Zero every daily counter and daily income column in one statement.
pub async fn reset_daily_counters(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE users SET
            daily_partners = 0,
            daily_team = 0,
            daily_active_partners = 0,
            daily_direct_income = '0',
            daily_level_income = '0',
            daily_total_income = '0',
            updated_at = NOW()
        "#,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Bulk-write recomputed team counts, touching only rows that drifted.
pub async fn apply_team_counts(pool: &PgPool, counts: &[TeamCounts]) -> Result<u64, sqlx::Error> {
    if counts.is_empty() {
        return Ok(0);
    }

    let ids: Vec<i64> = counts.iter().map(|c| c.user_id).collect();
    let partners: Vec<i64> = counts.iter().map(|c| c.total_partners).collect();
    let team: Vec<i64> = counts.iter().map(|c| c.total_team).collect();

    let result = sqlx::query(
        r#"
        UPDATE users AS u SET
            total_partners = c.total_partners,
            total_team = c.total_team,
            updated_at = NOW()
        FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::BIGINT[]) AS c(user_id, total_partners, total_team)
        WHERE u.user_id = c.user_id
          AND (u.total_partners <> c.total_partners OR u.total_team <> c.total_team)
        "#,
    )
    .bind(&ids)
    .bind(&partners)
    .bind(&team)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ─── User Reads ─────────────────────────────────────────────────────────────

pub async fn get_user(pool: &PgPool, user_id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

/// Lookup by wallet; callers pass the lower-case form.
pub async fn get_user_by_address(pool: &PgPool, wallet: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE wallet_address = $1")
        .bind(wallet)
        .fetch_optional(pool)
        .await
}

/// Which ids in `[from, to]` are already stored.
pub async fn existing_user_ids(pool: &PgPool, from: i64, to: i64) -> Result<Vec<i64>, sqlx::Error> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT user_id FROM users WHERE user_id BETWEEN $1 AND $2 ORDER BY user_id")
            .bind(from)
            .bind(to)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Every `(user_id, referred_by)` pair.
pub async fn referral_edges(pool: &PgPool) -> Result<Vec<(i64, Option<i64>)>, sqlx::Error> {
    sqlx::query_as("SELECT user_id, referred_by FROM users")
        .fetch_all(pool)
        .await
}

pub async fn direct_referrals_of(pool: &PgPool, referrers: &[i64]) -> Result<Vec<User>, sqlx::Error> {
    if referrers.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE referred_by = ANY($1) ORDER BY user_id")
        .bind(referrers)
        .fetch_all(pool)
        .await
}

fn push_user_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &UserFilter) {
    let mut prefix = " WHERE ";
    if let Some(wallet) = &filter.wallet_address {
        qb.push(prefix)
            .push("wallet_address ILIKE ")
            .push_bind(like_pattern(wallet))
            .push(" ESCAPE '\\'");
        prefix = " AND ";
    }
    if let Some(name) = &filter.full_name {
        qb.push(prefix)
            .push("full_name ILIKE ")
            .push_bind(like_pattern(name))
            .push(" ESCAPE '\\'");
    }
}

/// One page of users matching `filter` plus the total match count.
pub async fn search_users(
    pool: &PgPool,
    filter: &UserFilter,
    offset: i64,
    limit: i64,
) -> Result<(Vec<User>, i64), sqlx::Error> {
    let mut count: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM users");
    push_user_filter(&mut count, filter);
    let (total,) = count.build_query_as::<(i64,)>().fetch_one(pool).await?;

    let mut page: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM users");
    push_user_filter(&mut page, filter);
    page.push(" ORDER BY user_id LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let users = page.build_query_as::<User>().fetch_all(pool).await?;

    Ok((users, total))
}

/// Users created at or after `since` (all users when `None`).
pub async fn count_users(pool: &PgPool, since: Option<NaiveDateTime>) -> Result<i64, sqlx::Error> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM users WHERE ($1::TIMESTAMP IS NULL OR created_at >= $1)")
            .bind(since)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

// ─── Orders ─────────────────────────────────────────────────────────────────

/// Upsert keyed on (user_id, level). Returns true when the row is new.
pub async fn upsert_order(pool: &PgPool, order: &NewOrder) -> Result<bool, sqlx::Error> {
    let (inserted,): (bool,) = sqlx::query_as(
        r#"
        INSERT INTO orders (user_id, user_address, level, price, transaction_hash)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, level) DO UPDATE SET
            user_address = EXCLUDED.user_address,
            price = EXCLUDED.price,
            transaction_hash = COALESCE(EXCLUDED.transaction_hash, orders.transaction_hash),
            updated_at = NOW()
        RETURNING (xmax = 0) AS inserted
        "#,
    )
    .bind(order.user_id)
    .bind(&order.user_address)
    .bind(order.level)
    .bind(&order.price)
    .bind(&order.transaction_hash)
    .fetch_one(pool)
    .await?;
    Ok(inserted)
}

/// Sum of order prices (smallest unit, decimal string) since `since`.
pub async fn order_price_sum(pool: &PgPool, since: Option<NaiveDateTime>) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(CAST(price AS NUMERIC)), 0)::TEXT
        FROM orders
        WHERE ($1::TIMESTAMP IS NULL OR created_at >= $1)
        "#,
    )
    .bind(since)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

// ─── Transactions ───────────────────────────────────────────────────────────

/// Insert-if-absent on (receiver_id, from_id, amount, level). Only a first
/// insert credits the receiver's daily income and marks it active; the
/// first activation also counts toward the referrer's `daily_active_partners`
/// in the same transaction.
pub async fn record_reward(
    pool: &PgPool,
    reward: &NewTransaction,
    bucket: IncomeBucket,
) -> Result<RewardOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO transactions (receiver_id, receiver, from_id, from_address, amount, level, income_type, transaction_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (receiver_id, from_id, amount, level) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(reward.receiver_id)
    .bind(&reward.receiver)
    .bind(reward.from_id)
    .bind(&reward.from_address)
    .bind(&reward.amount)
    .bind(reward.level)
    .bind(&reward.income_type)
    .bind(&reward.transaction_hash)
    .fetch_optional(&mut *tx)
    .await?;

    if inserted.is_none() {
        tx.rollback().await?;
        return Ok(RewardOutcome::default());
    }

    let (was_active,): (bool,) = sqlx::query_as("SELECT is_active FROM users WHERE user_id = $1 FOR UPDATE")
        .bind(reward.receiver_id)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        UPDATE users SET
            daily_total_income = (CAST(daily_total_income AS NUMERIC) + CAST($1 AS NUMERIC))::TEXT,
            daily_direct_income = CASE WHEN $2 = 'direct'
                THEN (CAST(daily_direct_income AS NUMERIC) + CAST($1 AS NUMERIC))::TEXT
                ELSE daily_direct_income END,
            daily_level_income = CASE WHEN $2 = 'level'
                THEN (CAST(daily_level_income AS NUMERIC) + CAST($1 AS NUMERIC))::TEXT
                ELSE daily_level_income END,
            is_active = TRUE,
            updated_at = NOW()
        WHERE user_id = $3
        "#,
    )
    .bind(&reward.amount)
    .bind(bucket.as_str())
    .bind(reward.receiver_id)
    .execute(&mut *tx)
    .await?;

    if !was_active {
        sqlx::query(
            r#"
            UPDATE users SET daily_active_partners = daily_active_partners + 1, updated_at = NOW()
            WHERE user_id = (SELECT referred_by FROM users WHERE user_id = $1)
            "#,
        )
        .bind(reward.receiver_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(RewardOutcome {
        first_seen: true,
        activated: !was_active,
    })
}

/// Transactions received by `user_id`, newest first.
pub async fn transactions_for_user(
    pool: &PgPool,
    user_id: i64,
    limit: i64,
) -> Result<Vec<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE receiver_id = $1 ORDER BY id DESC LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ─── Slots ──────────────────────────────────────────────────────────────────

pub async fn upsert_slot(pool: &PgPool, slot: &SlotSnapshot) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO slots (user_id, wallet_address, level, referral_count, recycle_count, slot_transactions, is_upgraded, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (user_id, level) DO UPDATE SET
            wallet_address = EXCLUDED.wallet_address,
            referral_count = EXCLUDED.referral_count,
            recycle_count = EXCLUDED.recycle_count,
            slot_transactions = EXCLUDED.slot_transactions,
            is_upgraded = EXCLUDED.is_upgraded,
            is_active = EXCLUDED.is_active,
            updated_at = NOW()
        "#,
    )
    .bind(slot.user_id)
    .bind(&slot.wallet_address)
    .bind(slot.level)
    .bind(&slot.referral_count)
    .bind(&slot.recycle_count)
    .bind(&slot.slot_transactions)
    .bind(slot.is_upgraded)
    .bind(slot.is_active)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn slots_for_user(pool: &PgPool, user_id: i64) -> Result<Vec<Slot>, sqlx::Error> {
    sqlx::query_as::<_, Slot>("SELECT * FROM slots WHERE user_id = $1 ORDER BY level")
        .bind(user_id)
        .fetch_all(pool)
        .await
}

// ─── Settings ───────────────────────────────────────────────────────────────

pub async fn get_settings(pool: &PgPool) -> Result<Setting, sqlx::Error> {
    let row = sqlx::query_as::<_, Setting>("SELECT registration, slot_purchase FROM settings WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.unwrap_or_default())
}

pub async fn save_settings(pool: &PgPool, setting: Setting) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO settings (id, registration, slot_purchase)
        VALUES (1, $1, $2)
        ON CONFLICT (id) DO UPDATE SET
            registration = EXCLUDED.registration,
            slot_purchase = EXCLUDED.slot_purchase,
            updated_at = NOW()
        "#,
    )
    .bind(setting.registration)
    .bind(setting.slot_purchase)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("ali"), "%ali%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn counter_columns_are_distinct() {
        let all = [
            Counter::TotalPartners,
            Counter::TotalTeam,
            Counter::DailyPartners,
            Counter::DailyTeam,
            Counter::DailyActivePartners,
        ];
        let columns: std::collections::HashSet<_> = all.iter().map(|c| c.column()).collect();
        assert_eq!(columns.len(), all.len());
    }
}
