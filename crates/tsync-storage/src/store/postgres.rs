//! Postgres-backed [`ReleaseStore`].

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, warn};
use tsync_core::{
    BackfillCandidate, Briefing, DateWindow, Enrichment, EnrichmentProgress, ExistingRelease,
    JobLog, JobStatus, JobType, ReleaseDraft, ReleaseKey, ReleaseRecord, SyncState,
    TenderDocument, UpsertOutcome,
};
use uuid::Uuid;

use super::{
    apply_draft, apply_enrichment, choose_slug, new_record, CandidateFilter, EnrichmentWrite,
    ReleaseStore,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SLUG_CONSTRAINT: &str = "releases_slug_key";
const KEY_CONSTRAINT: &str = "releases_ocid_release_date_key";

/// Column order shared by the SELECT list and the upsert statement.
const RELEASE_COLUMNS: [&str; 37] = [
    "id",
    "ocid",
    "release_date",
    "slug",
    "tender_id",
    "title",
    "description",
    "buyer_name",
    "main_category",
    "status",
    "close_date",
    "tender_number",
    "province",
    "delivery_location",
    "special_conditions",
    "contact_person",
    "contact_email",
    "contact_phone",
    "briefing_required",
    "briefing_compulsory",
    "briefing_date",
    "briefing_time",
    "briefing_venue",
    "briefing_meeting_id",
    "briefing_passcode",
    "detailed_category",
    "organ_of_state",
    "organ_of_state_type",
    "estimated_value_min",
    "estimated_value_max",
    "documents",
    "document_count",
    "quality_score",
    "enriched_at",
    "raw",
    "created_at",
    "updated_at",
];

const INCOMPLETE_PREDICATE: &str = "(province IS NULL OR delivery_location IS NULL \
     OR contact_person IS NULL OR contact_email IS NULL OR contact_phone IS NULL \
     OR detailed_category IS NULL OR organ_of_state_type IS NULL)";

const UNCATEGORIZED_PREDICATE: &str = "detailed_category IS NULL";

#[derive(Debug, Clone)]
pub struct PgReleaseStore {
    pool: PgPool,
}

impl PgReleaseStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    async fn write_release(
        &self,
        draft: &ReleaseDraft,
        enrichment: Option<&Enrichment>,
        force_suffix: bool,
    ) -> Result<UpsertOutcome, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if let Some(mut record) = lock_release(&mut tx, &draft.key).await? {
            apply_draft(&mut record, draft, enrichment, now);
            save_record(&mut tx, &record).await?;
            tx.commit().await?;
            return Ok(UpsertOutcome {
                id: record.id,
                slug: record.slug,
                inserted: false,
            });
        }

        let base = choose_slug(draft, false, false);
        let base_taken = !force_suffix && slug_taken(&mut tx, &base).await?;
        let slug = choose_slug(draft, base_taken, force_suffix);
        let record = new_record(draft, enrichment, slug, now);
        save_record(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(UpsertOutcome {
            id: record.id,
            slug: record.slug,
            inserted: true,
        })
    }
}

/// Second write after a unique violation on the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewrite {
    /// Another release owns the title slug; write with the key suffix.
    SuffixedSlug,
    /// A concurrent writer inserted the same key first; the rewrite updates it.
    SameKey,
}

fn rewrite_for(constraint: Option<&str>) -> Option<Rewrite> {
    match constraint? {
        SLUG_CONSTRAINT => Some(Rewrite::SuffixedSlug),
        KEY_CONSTRAINT => Some(Rewrite::SameKey),
        _ => None,
    }
}

fn unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

async fn lock_release(
    tx: &mut Transaction<'_, Postgres>,
    key: &ReleaseKey,
) -> Result<Option<ReleaseRecord>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM releases WHERE ocid = $1 AND release_date = $2 FOR UPDATE",
        RELEASE_COLUMNS.join(", ")
    );
    let row = sqlx::query(&sql)
        .bind(&key.ocid)
        .bind(key.release_date)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(release_from_row).transpose()
}

async fn slug_taken(tx: &mut Transaction<'_, Postgres>, slug: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 AS taken FROM releases WHERE slug = $1")
        .bind(slug)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.is_some())
}

async fn save_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &ReleaseRecord,
) -> Result<(), sqlx::Error> {
    let placeholders = (1..=RELEASE_COLUMNS.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = RELEASE_COLUMNS
        .iter()
        .filter(|c| !matches!(**c, "id" | "slug" | "created_at"))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO releases ({}) VALUES ({placeholders}) ON CONFLICT (id) DO UPDATE SET {updates}",
        RELEASE_COLUMNS.join(", ")
    );

    let e = &record.enrichment;
    let documents = e
        .documents
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| sqlx::Error::Encode(Box::new(err)))?;

    sqlx::query(&sql)
        .bind(record.id)
        .bind(&record.key.ocid)
        .bind(record.key.release_date)
        .bind(&record.slug)
        .bind(&record.tender_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.buyer_name)
        .bind(&record.main_category)
        .bind(&record.status)
        .bind(record.close_date)
        .bind(&record.tender_number)
        .bind(&e.province)
        .bind(&e.delivery_location)
        .bind(&e.special_conditions)
        .bind(&e.contact_person)
        .bind(&e.contact_email)
        .bind(&e.contact_phone)
        .bind(e.briefing.required)
        .bind(e.briefing.compulsory)
        .bind(e.briefing.date)
        .bind(&e.briefing.time)
        .bind(&e.briefing.venue)
        .bind(&e.briefing.meeting_id)
        .bind(&e.briefing.passcode)
        .bind(&e.detailed_category)
        .bind(&e.organ_of_state)
        .bind(&e.organ_of_state_type)
        .bind(e.estimated_value_min)
        .bind(e.estimated_value_max)
        .bind(documents)
        .bind(e.document_count())
        .bind(record.quality_score)
        .bind(record.enriched_at)
        .bind(&record.raw)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn release_from_row(row: &PgRow) -> Result<ReleaseRecord, sqlx::Error> {
    let documents = row
        .try_get::<Option<serde_json::Value>, _>("documents")?
        .map(serde_json::from_value::<Vec<TenderDocument>>)
        .transpose()
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;

    Ok(ReleaseRecord {
        id: row.try_get("id")?,
        key: ReleaseKey::new(
            row.try_get::<String, _>("ocid")?,
            row.try_get::<DateTime<Utc>, _>("release_date")?,
        ),
        slug: row.try_get("slug")?,
        tender_id: row.try_get("tender_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        buyer_name: row.try_get("buyer_name")?,
        main_category: row.try_get("main_category")?,
        status: row.try_get("status")?,
        close_date: row.try_get("close_date")?,
        tender_number: row.try_get("tender_number")?,
        enrichment: Enrichment {
            province: row.try_get("province")?,
            delivery_location: row.try_get("delivery_location")?,
            special_conditions: row.try_get("special_conditions")?,
            contact_person: row.try_get("contact_person")?,
            contact_email: row.try_get("contact_email")?,
            contact_phone: row.try_get("contact_phone")?,
            briefing: Briefing {
                required: row.try_get("briefing_required")?,
                compulsory: row.try_get("briefing_compulsory")?,
                date: row.try_get::<Option<NaiveDate>, _>("briefing_date")?,
                time: row.try_get("briefing_time")?,
                venue: row.try_get("briefing_venue")?,
                meeting_id: row.try_get("briefing_meeting_id")?,
                passcode: row.try_get("briefing_passcode")?,
            },
            detailed_category: row.try_get("detailed_category")?,
            organ_of_state: row.try_get("organ_of_state")?,
            organ_of_state_type: row.try_get("organ_of_state_type")?,
            estimated_value_min: row.try_get("estimated_value_min")?,
            estimated_value_max: row.try_get("estimated_value_max")?,
            documents,
        },
        quality_score: row.try_get("quality_score")?,
        enriched_at: row.try_get("enriched_at")?,
        raw: row.try_get("raw")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<JobLog> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    Ok(JobLog {
        id: row.try_get("id")?,
        job_type: job_type.parse().map_err(anyhow::Error::msg)?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        note: row.try_get("note")?,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl ReleaseStore for PgReleaseStore {
    async fn existing_releases(
        &self,
        keys: &[ReleaseKey],
    ) -> Result<HashMap<ReleaseKey, ExistingRelease>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let ocids: Vec<String> = keys.iter().map(|k| k.ocid.clone()).collect();
        let dates: Vec<DateTime<Utc>> = keys.iter().map(|k| k.release_date).collect();
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.ocid, r.release_date, (r.detailed_category IS NOT NULL) AS categorized
            FROM releases r
            JOIN UNNEST($1::text[], $2::timestamptz[]) AS k(ocid, release_date)
              ON r.ocid = k.ocid AND r.release_date = k.release_date
            "#,
        )
        .bind(ocids)
        .bind(dates)
        .fetch_all(&self.pool)
        .await
        .context("loading existing releases")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = ReleaseKey::new(
                row.try_get::<String, _>("ocid")?,
                row.try_get::<DateTime<Utc>, _>("release_date")?,
            );
            out.insert(
                key,
                ExistingRelease {
                    id: row.try_get("id")?,
                    categorized: row.try_get("categorized")?,
                },
            );
        }
        Ok(out)
    }

    async fn find_release(&self, key: &ReleaseKey) -> Result<Option<ReleaseRecord>> {
        let sql = format!(
            "SELECT {} FROM releases WHERE ocid = $1 AND release_date = $2",
            RELEASE_COLUMNS.join(", ")
        );
        let row = sqlx::query(&sql)
            .bind(&key.ocid)
            .bind(key.release_date)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading release {key}"))?;
        Ok(row.as_ref().map(release_from_row).transpose()?)
    }

    async fn upsert_release(
        &self,
        draft: &ReleaseDraft,
        enrichment: Option<&Enrichment>,
    ) -> Result<UpsertOutcome> {
        match self.write_release(draft, enrichment, false).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => match rewrite_for(unique_violation(&err).as_deref()) {
                Some(Rewrite::SuffixedSlug) => {
                    warn!(key = %draft.key, "slug collision, retrying with suffix");
                    self.write_release(draft, enrichment, true)
                        .await
                        .with_context(|| format!("upserting {} with suffixed slug", draft.key))
                }
                Some(Rewrite::SameKey) => self
                    .write_release(draft, enrichment, false)
                    .await
                    .with_context(|| format!("re-upserting {}", draft.key)),
                None => Err(err).with_context(|| format!("upserting {}", draft.key)),
            },
        }
    }

    async fn merge_enrichment(&self, write: &EnrichmentWrite) -> Result<bool> {
        Ok(self.merge_enrichment_batch(std::slice::from_ref(write)).await? == 1)
    }

    async fn merge_enrichment_batch(&self, writes: &[EnrichmentWrite]) -> Result<usize> {
        if writes.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("opening enrichment batch")?;
        let mut updated = 0;
        for write in writes {
            let Some(mut record) = lock_release(&mut tx, &write.key).await? else {
                continue;
            };
            apply_enrichment(&mut record, write.tender_number.as_deref(), &write.enrichment, now);
            save_record(&mut tx, &record)
                .await
                .with_context(|| format!("merging enrichment into {}", write.key))?;
            updated += 1;
        }
        tx.commit().await.context("committing enrichment batch")?;
        Ok(updated)
    }

    async fn count_uncategorized(&self, window: &DateWindow) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM releases WHERE release_date BETWEEN $1 AND $2 AND {UNCATEGORIZED_PREDICATE}"
        );
        let n: i64 = sqlx::query(&sql)
            .bind(window.from)
            .bind(window.to)
            .fetch_one(&self.pool)
            .await
            .context("counting uncategorized releases")?
            .try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn select_candidates(
        &self,
        window: &DateWindow,
        filter: CandidateFilter,
        limit: usize,
    ) -> Result<Vec<BackfillCandidate>> {
        let predicate = match filter {
            CandidateFilter::Incomplete => INCOMPLETE_PREDICATE,
            CandidateFilter::Uncategorized => UNCATEGORIZED_PREDICATE,
        };
        let sql = format!(
            "SELECT ocid, release_date, title, tender_id, tender_number, raw FROM releases \
             WHERE release_date BETWEEN $1 AND $2 AND {predicate} \
             ORDER BY release_date DESC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(window.from)
            .bind(window.to)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("selecting enrichment candidates")?;

        rows.iter()
            .map(|row| -> Result<BackfillCandidate> {
                Ok(BackfillCandidate {
                    key: ReleaseKey::new(
                        row.try_get::<String, _>("ocid")?,
                        row.try_get::<DateTime<Utc>, _>("release_date")?,
                    ),
                    title: row.try_get("title")?,
                    tender_id: row.try_get("tender_id")?,
                    tender_number: row.try_get("tender_number")?,
                    raw: row.try_get("raw")?,
                })
            })
            .collect()
    }

    async fn enrichment_progress(&self, window: &DateWindow) -> Result<Vec<EnrichmentProgress>> {
        let sql = format!(
            "SELECT (release_date AT TIME ZONE 'UTC')::date AS period, COUNT(*) AS total, \
             COUNT(*) FILTER (WHERE {UNCATEGORIZED_PREDICATE}) AS missing \
             FROM releases WHERE release_date BETWEEN $1 AND $2 GROUP BY 1 ORDER BY 1"
        );
        let rows = sqlx::query(&sql)
            .bind(window.from)
            .bind(window.to)
            .fetch_all(&self.pool)
            .await
            .context("aggregating enrichment progress")?;
        rows.iter()
            .map(|row| -> Result<EnrichmentProgress> {
                Ok(EnrichmentProgress {
                    period: row.try_get("period")?,
                    total: row.try_get("total")?,
                    missing: row.try_get("missing")?,
                })
            })
            .collect()
    }

    async fn sync_state(&self, feed: &str) -> Result<Option<SyncState>> {
        let row = sqlx::query(
            "SELECT feed, last_run_at, last_success_at, cursor_date FROM sync_state WHERE feed = $1",
        )
        .bind(feed)
        .fetch_optional(&self.pool)
        .await
        .context("loading sync state")?;
        row.map(|row| -> Result<SyncState> {
            Ok(SyncState {
                feed: row.try_get("feed")?,
                last_run_at: row.try_get("last_run_at")?,
                last_success_at: row.try_get("last_success_at")?,
                cursor: row.try_get("cursor_date")?,
            })
        })
        .transpose()
    }

    async fn record_run_started(&self, feed: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (feed, last_run_at) VALUES ($1, $2)
            ON CONFLICT (feed) DO UPDATE SET last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(feed)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("recording run start")?;
        Ok(())
    }

    async fn record_run_succeeded(
        &self,
        feed: &str,
        cursor: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        // GREATEST ignores NULLs, so a missing cursor keeps the stored one
        sqlx::query(
            r#"
            INSERT INTO sync_state (feed, last_success_at, cursor_date) VALUES ($1, $2, $3)
            ON CONFLICT (feed) DO UPDATE SET
              last_success_at = EXCLUDED.last_success_at,
              cursor_date = GREATEST(sync_state.cursor_date, EXCLUDED.cursor_date)
            "#,
        )
        .bind(feed)
        .bind(at)
        .bind(cursor)
        .execute(&self.pool)
        .await
        .context("recording run success")?;
        Ok(())
    }

    async fn create_job(&self, job_type: JobType, metadata: &serde_json::Value) -> Result<JobLog> {
        let job = JobLog {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            note: None,
            metadata: metadata.clone(),
        };
        sqlx::query(
            "INSERT INTO job_logs (id, job_type, status, started_at, metadata) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job.id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(&job.metadata)
        .execute(&self.pool)
        .await
        .context("creating job log")?;
        Ok(job)
    }

    async fn finalize_job(
        &self,
        id: Uuid,
        status: JobStatus,
        note: &str,
        metadata: &serde_json::Value,
    ) -> Result<bool> {
        if !status.is_terminal() {
            bail!("cannot finalize job {id} with non-terminal status {}", status.as_str());
        }
        let result = sqlx::query(
            r#"
            UPDATE job_logs SET status = $2, note = $3, metadata = $4, finished_at = now()
            WHERE id = $1 AND finished_at IS NULL
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(note)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .context("finalizing job log")?;
        Ok(result.rows_affected() == 1)
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobLog>> {
        let rows = sqlx::query(
            "SELECT id, job_type, status, started_at, finished_at, note, metadata FROM job_logs \
             ORDER BY started_at DESC LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("listing job logs")?;
        rows.iter().map(job_from_row).collect()
    }

    async fn flag(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT value FROM app_flags WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading flag {key}"))?;
        Ok(match row {
            Some(row) => row.try_get("value")?,
            None => false,
        })
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_flags (key, value, updated_at) VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing flag {key}"))?;
        Ok(())
    }

    async fn try_acquire_lock(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO pipeline_locks (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, now(), now() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE SET
              holder = EXCLUDED.holder,
              acquired_at = EXCLUDED.acquired_at,
              expires_at = EXCLUDED.expires_at
            WHERE pipeline_locks.expires_at < now() OR pipeline_locks.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("acquiring lock {name}"))?;
        Ok(row.is_some())
    }

    async fn release_lock(&self, name: &str, holder: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM pipeline_locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .with_context(|| format!("releasing lock {name}"))?;
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: Uuid, step: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT output FROM sync_steps WHERE run_id = $1 AND step = $2")
            .bind(run_id)
            .bind(step)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading checkpoint {step}"))?;
        row.map(|row| row.try_get("output").map_err(anyhow::Error::from))
            .transpose()
    }

    async fn save_checkpoint(
        &self,
        run_id: Uuid,
        step: &str,
        output: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_steps (run_id, step, output) VALUES ($1, $2, $3)
            ON CONFLICT (run_id, step) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(step)
        .bind(output)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving checkpoint {step}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn only_known_unique_violations_are_rewritten() {
        assert_eq!(rewrite_for(Some("releases_slug_key")), Some(Rewrite::SuffixedSlug));
        assert_eq!(
            rewrite_for(Some("releases_ocid_release_date_key")),
            Some(Rewrite::SameKey)
        );
        assert_eq!(rewrite_for(Some("job_logs_pkey")), None);
        assert_eq!(rewrite_for(Some("")), None);
        assert_eq!(rewrite_for(None), None);
    }

    #[test]
    fn suffixed_rewrite_never_reuses_the_taken_slug() {
        let draft = ReleaseDraft {
            key: ReleaseKey::new(
                "ocds-9t57fa-1001",
                Utc.with_ymd_and_hms(2025, 3, 2, 8, 0, 0).unwrap(),
            ),
            tender_id: None,
            title: Some("Supply of Chairs".into()),
            description: None,
            buyer_name: None,
            main_category: None,
            status: None,
            close_date: None,
            tender_number: None,
            raw: serde_json::Value::Null,
        };
        let base = choose_slug(&draft, false, false);
        let rewritten = choose_slug(&draft, false, true);
        assert_ne!(base, rewritten);
        assert!(rewritten.starts_with(&base));
        assert_eq!(rewritten, choose_slug(&draft, true, false));
    }
}
