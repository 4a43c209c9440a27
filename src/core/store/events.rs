use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::warn;

use super::types::{EventCategory, EventFilter, EventPage, EventRecord, EventType, NewEvent};
use super::{Store, json_col};

const EVENT_COLUMNS: &str = "id, created_at, event_type, source, direction, request_id,
    company_id, company_name, message, payload_json";

pub const MAX_PAGE_SIZE: usize = 500;
/// Highest page whose offset still fits an SQLite integer.
pub const MAX_PAGE: usize = (i64::MAX as usize) / MAX_PAGE_SIZE;

fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let event_type: String = row.get(2)?;
    Ok(EventRecord {
        id: row.get(0)?,
        created_at: row.get(1)?,
        event_type: EventType::from_str_opt(&event_type).unwrap_or(EventType::Notification),
        source: row.get(3)?,
        direction: row.get(4)?,
        request_id: row.get(5)?,
        company_id: row.get(6)?,
        company_name: row.get(7)?,
        message: row.get(8)?,
        payload: json_col(row, 9)?,
    })
}

/// Denormalized company flags driven by recognized event keys.
fn company_flag_update(key: &str) -> Option<&'static str> {
    let sql = match key {
        "analysis_start" => {
            "UPDATE companies SET analysis_started_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                analysis_ok = 0, server_error = 0, analysis_status = 'running'
             WHERE inn = ?1"
        }
        "analysis_success" => {
            "UPDATE companies SET analysis_ok = 1, server_error = 0, analysis_status = 'completed'
             WHERE inn = ?1"
        }
        "analysis_failed" => {
            "UPDATE companies SET server_error = 1, analysis_status = 'failed' WHERE inn = ?1"
        }
        "analysis_stopped" => "UPDATE companies SET analysis_status = 'stopped' WHERE inn = ?1",
        "analysis_deferred" => "UPDATE companies SET analysis_status = 'queued' WHERE inn = ?1",
        "no_valid_site" => "UPDATE companies SET no_valid_site = 1 WHERE inn = ?1",
        _ => return None,
    };
    Some(sql)
}

fn apply_company_flags(db: &Connection, event: &NewEvent) {
    if !matches!(
        event.event_type,
        EventType::Notification | EventType::Error
    ) {
        return;
    }
    let (Some(key), Some(company_id)) = (event.key(), event.company_id.as_deref()) else {
        return;
    };
    let Some(sql) = company_flag_update(key) else {
        return;
    };
    if let Err(e) = db.execute(sql, params![company_id]) {
        warn!(
            "Event side effect '{}' failed for company {}: {}",
            key, company_id, e
        );
    }
}

fn category_clause(category: EventCategory) -> Option<&'static str> {
    match category {
        EventCategory::All => None,
        EventCategory::Traffic => Some("event_type IN ('request', 'response')"),
        EventCategory::Error => Some("event_type = 'error'"),
        EventCategory::Notification => Some("event_type = 'notification'"),
    }
}

/// Widen a bare `YYYY-MM-DD` upper bound to the end of that day.
fn upper_bound(to: &str) -> String {
    if to.len() == 10 {
        format!("{}T23:59:59.999Z", to)
    } else {
        to.to_string()
    }
}

fn build_where(filter: &EventFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(c) = category_clause(filter.category) {
        clauses.push(c.to_string());
    }
    if let Some(company) = filter.company_id.as_deref().filter(|s| !s.is_empty()) {
        values.push(Value::Text(company.to_string()));
        clauses.push(format!("company_id = ?{}", values.len()));
    }
    if let Some(source) = filter.source.as_deref().filter(|s| !s.is_empty()) {
        values.push(Value::Text(source.to_string()));
        clauses.push(format!("source = ?{}", values.len()));
    }
    if let Some(from) = filter.from.as_deref().filter(|s| !s.is_empty()) {
        values.push(Value::Text(from.to_string()));
        clauses.push(format!("created_at >= ?{}", values.len()));
    }
    if let Some(to) = filter.to.as_deref().filter(|s| !s.is_empty()) {
        values.push(Value::Text(upper_bound(to)));
        clauses.push(format!("created_at <= ?{}", values.len()));
    }
    if let Some(q) = filter.query.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        values.push(Value::Text(format!("%{}%", q)));
        let n = values.len();
        clauses.push(format!(
            "(message LIKE ?{n} OR company_id LIKE ?{n} OR company_name LIKE ?{n}
              OR source LIKE ?{n} OR request_id LIKE ?{n} OR payload_json LIKE ?{n})"
        ));
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (sql, values)
}

impl Store {
    /// Append one immutable event. Recognized notification/error keys also
    /// update the company's denormalized flags; that update is best effort and
    /// never fails the append.
    pub async fn append_event(&self, event: &NewEvent) -> Result<EventRecord> {
        let payload_json = event
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let db = self.db.lock().await;

        let company_name = match (&event.company_name, &event.company_id) {
            (Some(name), _) => Some(name.clone()),
            (None, Some(id)) => db
                .query_row(
                    "SELECT short_name FROM companies WHERE inn = ?1",
                    params![id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()
                .unwrap_or_default()
                .flatten(),
            (None, None) => None,
        };

        db.execute(
            "INSERT INTO analysis_events
                (event_type, source, direction, request_id, company_id, company_name, message, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_type.as_str(),
                event.source,
                event.direction,
                event.request_id,
                event.company_id,
                company_name,
                event.message,
                payload_json,
            ],
        )?;
        let id = db.last_insert_rowid();

        apply_company_flags(&db, event);

        let rec = db.query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM analysis_events WHERE id = ?1"),
            params![id],
            map_event_row,
        )?;
        Ok(rec)
    }

    /// Filtered, newest-first page of events. `page` is 1-based.
    pub async fn list_events(
        &self,
        filter: &EventFilter,
        page: usize,
        page_size: usize,
    ) -> Result<EventPage> {
        let page = page.clamp(1, MAX_PAGE);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let (where_sql, mut values) = build_where(filter);

        let db = self.db.lock().await;
        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM analysis_events {where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(page_size as i64));
        let limit_idx = values.len();
        values.push(Value::Integer(((page - 1) * page_size) as i64));
        let offset_idx = values.len();

        let mut stmt = db.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM analysis_events {where_sql}
             ORDER BY id DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), map_event_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }

        Ok(EventPage {
            items,
            total,
            page,
            page_size,
        })
    }

    pub async fn purge_events(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let n = db.execute("DELETE FROM analysis_events", [])?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::super::types::CompanyRecord;
    use super::*;

    #[tokio::test]
    async fn huge_page_is_clamped_to_an_empty_page() {
        let store = test_store().await;
        store
            .append_event(&NewEvent::new(EventType::Request, "ai-integration"))
            .await
            .unwrap();

        let page = store
            .list_events(&EventFilter::default(), usize::MAX, MAX_PAGE_SIZE)
            .await
            .unwrap();
        assert_eq!(page.page, MAX_PAGE);
        assert_eq!(page.total, 1);
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn append_fills_company_name_and_applies_flags() {
        let store = test_store().await;
        store
            .upsert_company(&CompanyRecord {
                inn: "7707083893".to_string(),
                short_name: Some("Sberbank".to_string()),
                okved: None,
                industry: None,
                status: None,
            })
            .await
            .unwrap();

        let rec = store
            .append_event(&NewEvent::notification(
                "analysis_start",
                Some("7707083893"),
                "started",
            ))
            .await
            .unwrap();
        assert_eq!(rec.company_name.as_deref(), Some("Sberbank"));
        assert_eq!(rec.event_type, EventType::Notification);

        store
            .append_event(&NewEvent::notification(
                "analysis_failed",
                Some("7707083893"),
                "failed",
            ))
            .await
            .unwrap();
        let flags = store.company_flags("7707083893").await.unwrap().unwrap();
        assert!(flags.server_error);
        assert!(!flags.analysis_ok);
        assert!(flags.analysis_started_at.is_some());
        assert_eq!(flags.analysis_status.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn side_effect_for_unknown_company_does_not_block_append() {
        let store = test_store().await;
        let rec = store
            .append_event(&NewEvent::notification(
                "analysis_success",
                Some("nope"),
                "ok",
            ))
            .await
            .unwrap();
        assert!(rec.id > 0);
        assert!(rec.company_name.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_category_and_paginates_newest_first() {
        let store = test_store().await;
        for i in 0..5 {
            store
                .append_event(
                    &NewEvent::new(EventType::Request, "ai-integration")
                        .with_company("100")
                        .with_message(format!("GET /v1/lookup #{i}")),
                )
                .await
                .unwrap();
        }
        store
            .append_event(&NewEvent::new(EventType::Error, "ai-integration").with_message("boom"))
            .await
            .unwrap();
        store
            .append_event(&NewEvent::notification("analysis_start", Some("200"), "go"))
            .await
            .unwrap();

        let traffic = EventFilter {
            category: EventCategory::Traffic,
            ..Default::default()
        };
        let page = store.list_events(&traffic, 1, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].message.as_deref(), Some("GET /v1/lookup #4"));
        let page3 = store.list_events(&traffic, 3, 2).await.unwrap();
        assert_eq!(page3.items.len(), 1);
        assert_eq!(page3.items[0].message.as_deref(), Some("GET /v1/lookup #0"));

        let errors = EventFilter {
            category: EventCategory::Error,
            ..Default::default()
        };
        assert_eq!(store.list_events(&errors, 1, 50).await.unwrap().total, 1);

        let text = EventFilter {
            query: Some("boom".to_string()),
            ..Default::default()
        };
        assert_eq!(store.list_events(&text, 1, 50).await.unwrap().total, 1);

        let company = EventFilter {
            company_id: Some("200".to_string()),
            ..Default::default()
        };
        let page = store.list_events(&company, 1, 50).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].event_type, EventType::Notification);
    }

    #[tokio::test]
    async fn date_range_filter_and_purge() {
        let store = test_store().await;
        store
            .append_event(&NewEvent::new(EventType::Response, "ai-integration"))
            .await
            .unwrap();

        let future = EventFilter {
            from: Some("2999-01-01".to_string()),
            ..Default::default()
        };
        assert_eq!(store.list_events(&future, 1, 50).await.unwrap().total, 0);

        let past = EventFilter {
            from: Some("2000-01-01".to_string()),
            to: Some("2999-12-31".to_string()),
            ..Default::default()
        };
        assert_eq!(store.list_events(&past, 1, 50).await.unwrap().total, 1);

        assert_eq!(store.purge_events().await.unwrap(), 1);
        assert_eq!(
            store
                .list_events(&EventFilter::default(), 1, 50)
                .await
                .unwrap()
                .total,
            0
        );
    }
}
