use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::store::Settlement;
use crate::models::account::{Account, Tier};
use crate::models::generation::GenerationRequest;
use crate::models::thumbnail::{
    AspectRatio, ColorScheme, NewThumbnail, Style, ThumbnailRecord, ThumbnailStatus,
};

const THUMBNAIL_COLUMNS: &str = "id, owner_id, title, detail, prompt, style, color_scheme, \
     aspect_ratio, status, image_url, error, uses_reference_image, credits_required, \
     credits_charged, created_at, updated_at, completed_at";

fn decode_err<E>(e: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(e))
}

fn thumbnail_from_row(row: &PgRow) -> Result<ThumbnailRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let aspect_ratio: String = row.try_get("aspect_ratio")?;
    let style: String = row.try_get("style")?;
    let color_scheme: String = row.try_get("color_scheme")?;

    Ok(ThumbnailRecord {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        title: row.try_get("title")?,
        detail: row.try_get("detail")?,
        prompt: row.try_get("prompt")?,
        style: Style::from_key(&style),
        color_scheme: ColorScheme::from_key(&color_scheme),
        aspect_ratio: aspect_ratio.parse::<AspectRatio>().map_err(decode_err)?,
        status: status.parse::<ThumbnailStatus>().map_err(decode_err)?,
        image_url: row.try_get("image_url")?,
        error: row.try_get("error")?,
        uses_reference_image: row.try_get("uses_reference_image")?,
        credits_required: row.try_get("credits_required")?,
        credits_charged: row.try_get("credits_charged")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Get the ledger view of an account
pub async fn get_account(pool: &PgPool, owner_id: Uuid) -> Result<Option<Account>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, tier, credits, total_credits, created_at, updated_at
        FROM accounts
        WHERE id = $1
        "#,
    )
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| -> Result<Account, sqlx::Error> {
        let tier: String = r.try_get("tier")?;
        Ok(Account {
            id: r.try_get("id")?,
            tier: tier.parse::<Tier>().map_err(decode_err)?,
            credits: r.try_get("credits")?,
            total_credits: r.try_get("total_credits")?,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
        })
    })
    .transpose()
}

/// Insert a thumbnail record in the `generating` state
pub async fn create_thumbnail(
    pool: &PgPool,
    new: &NewThumbnail,
) -> Result<ThumbnailRecord, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO thumbnails (owner_id, title, detail, style, color_scheme, aspect_ratio,
                                status, uses_reference_image, credits_required)
        VALUES ($1, $2, $3, $4, $5, $6, 'generating', $7, $8)
        RETURNING {}
        "#,
        THUMBNAIL_COLUMNS
    ))
    .bind(new.owner_id)
    .bind(&new.title)
    .bind(&new.detail)
    .bind(new.style.as_ref())
    .bind(new.color_scheme.as_ref())
    .bind(new.aspect_ratio.as_ref())
    .bind(new.uses_reference_image)
    .bind(new.credits_required)
    .fetch_one(pool)
    .await?;

    thumbnail_from_row(&row)
}

/// Get a thumbnail by ID, scoped to its owner
pub async fn get_thumbnail_for_owner(
    pool: &PgPool,
    owner_id: Uuid,
    thumbnail_id: Uuid,
) -> Result<Option<ThumbnailRecord>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM thumbnails WHERE id = $1 AND owner_id = $2",
        THUMBNAIL_COLUMNS
    ))
    .bind(thumbnail_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(thumbnail_from_row).transpose()
}

/// Newest-first listing of an owner's thumbnails
pub async fn list_thumbnails_for_owner(
    pool: &PgPool,
    owner_id: Uuid,
    limit: i64,
) -> Result<Vec<ThumbnailRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM thumbnails WHERE owner_id = $1 ORDER BY created_at DESC LIMIT $2",
        THUMBNAIL_COLUMNS
    ))
    .bind(owner_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(thumbnail_from_row).collect()
}

/// Transition a generating record to `failed`.
///
/// Returns `false` if the record was already terminal.
pub async fn mark_thumbnail_failed(
    pool: &PgPool,
    thumbnail_id: Uuid,
    error: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE thumbnails
        SET status = 'failed',
            error = $2,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'generating'
        "#,
    )
    .bind(thumbnail_id)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// How an earlier delivery of this job ended, if it reached a terminal state.
///
/// `None` means the record is still generating and has no settlement. A
/// missing record counts as closed.
pub async fn prior_settlement(
    pool: &PgPool,
    record_id: Uuid,
) -> Result<Option<Settlement>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT t.status,
               EXISTS (SELECT 1 FROM credit_settlements s WHERE s.record_id = t.id) AS settled
        FROM thumbnails t
        WHERE t.id = $1
        "#,
    )
    .bind(record_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(Some(Settlement::RecordClosed));
    };

    let settled: bool = row.try_get("settled")?;
    let status: String = row.try_get("status")?;
    let status = status.parse::<ThumbnailStatus>().map_err(decode_err)?;

    Ok(if settled {
        Some(Settlement::AlreadySettled)
    } else if status.is_terminal() {
        Some(Settlement::RecordClosed)
    } else {
        None
    })
}

/// Complete a record and debit its owner in one transaction.
///
/// The settlement row keyed by the record id makes this idempotent under
/// redelivery. The debit is a conditional decrement; if the balance no
/// longer covers the cost the record still completes and the ledger is left
/// untouched.
pub async fn complete_and_settle(
    pool: &PgPool,
    job: &GenerationRequest,
    prompt: &str,
    image_url: &str,
) -> Result<Settlement, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        r#"
        INSERT INTO credit_settlements (record_id, owner_id, amount, debited)
        VALUES ($1, $2, $3, FALSE)
        ON CONFLICT (record_id) DO NOTHING
        "#,
    )
    .bind(job.record_id)
    .bind(job.owner_id)
    .bind(job.credits_required)
    .execute(&mut *tx)
    .await?;

    if claimed.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(Settlement::AlreadySettled);
    }

    let remaining: Option<i32> = sqlx::query_scalar(
        r#"
        UPDATE accounts
        SET credits = credits - $2,
            updated_at = NOW()
        WHERE id = $1 AND credits >= $2
        RETURNING credits
        "#,
    )
    .bind(job.owner_id)
    .bind(job.credits_required)
    .fetch_optional(&mut *tx)
    .await?;

    let charged = if remaining.is_some() { job.credits_required } else { 0 };

    let completed = sqlx::query(
        r#"
        UPDATE thumbnails
        SET status = 'completed',
            image_url = $2,
            prompt = $3,
            credits_charged = $4,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'generating'
        "#,
    )
    .bind(job.record_id)
    .bind(image_url)
    .bind(prompt)
    .bind(charged)
    .execute(&mut *tx)
    .await?;

    if completed.rows_affected() == 0 {
        // Record is already terminal; drop the debit with the rest of the transaction.
        tx.rollback().await?;
        return Ok(Settlement::RecordClosed);
    }

    if remaining.is_some() {
        sqlx::query("UPDATE credit_settlements SET debited = TRUE WHERE record_id = $1")
            .bind(job.record_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    Ok(match remaining {
        Some(remaining) => Settlement::Debited { remaining },
        None => Settlement::Underfunded,
    })
}
