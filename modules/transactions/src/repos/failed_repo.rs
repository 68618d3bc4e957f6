use sqlx::PgExecutor;
use uuid::Uuid;

/// A delivery the consumer gave up on
#[derive(Debug, Clone)]
pub struct FailedEvent<'a> {
    pub event_id: Option<Uuid>,
    pub subject: &'a str,
    pub payload: &'a str,
    pub error: &'a str,
    pub reason: &'a str,
}

/// Insert a failed delivery into the dead letter table
pub async fn insert<'e, E>(executor: E, event: &FailedEvent<'_>) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO failed_events (event_id, subject, payload, error, reason)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event.event_id)
    .bind(event.subject)
    .bind(event.payload)
    .bind(event.error)
    .bind(event.reason)
    .execute(executor)
    .await?;

    Ok(())
}
