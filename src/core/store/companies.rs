use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params, params_from_iter};

use super::types::{CompanyFilter, CompanyFlags, CompanyRecord};
use super::{Store, bool_col};

impl Store {
    pub async fn upsert_company(&self, company: &CompanyRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO companies (inn, short_name, okved, industry, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(inn) DO UPDATE SET
                short_name = COALESCE(excluded.short_name, companies.short_name),
                okved = COALESCE(excluded.okved, companies.okved),
                industry = COALESCE(excluded.industry, companies.industry),
                status = COALESCE(excluded.status, companies.status),
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')",
            params![
                company.inn,
                company.short_name,
                company.okved,
                company.industry,
                company.status
            ],
        )?;
        Ok(())
    }

    pub async fn company_name(&self, inn: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let name = db
            .query_row(
                "SELECT short_name FROM companies WHERE inn = ?1",
                params![inn],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(name.flatten())
    }

    pub async fn company_flags(&self, inn: &str) -> Result<Option<CompanyFlags>> {
        let db = self.db.lock().await;
        let flags = db
            .query_row(
                "SELECT inn, analysis_ok, server_error, no_valid_site, analysis_started_at, analysis_status
                 FROM companies WHERE inn = ?1",
                params![inn],
                |row| {
                    Ok(CompanyFlags {
                        inn: row.get(0)?,
                        analysis_ok: bool_col(row, 1)?,
                        server_error: bool_col(row, 2)?,
                        no_valid_site: bool_col(row, 3)?,
                        analysis_started_at: row.get(4)?,
                        analysis_status: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(flags)
    }

    /// Clear the denormalized analysis columns, e.g. after removal from the queue.
    pub async fn reset_company_flags(&self, inns: &[String]) -> Result<usize> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "UPDATE companies SET analysis_ok = 0, server_error = 0, no_valid_site = 0,
                analysis_started_at = NULL, analysis_status = NULL,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE inn = ?1",
        )?;
        let mut n = 0;
        for inn in inns {
            n += stmt.execute(params![inn])?;
        }
        Ok(n)
    }

    /// Company ids matching a filter, ordered by inn.
    pub async fn find_company_ids(&self, filter: &CompanyFilter, limit: usize) -> Result<Vec<String>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(q) = filter.query.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            values.push(Value::Text(format!("%{}%", q)));
            let n = values.len();
            clauses.push(format!("(inn LIKE ?{n} OR short_name LIKE ?{n})"));
        }
        if let Some(okved) = filter.okved.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            values.push(Value::Text(format!("{}%", okved)));
            clauses.push(format!("okved LIKE ?{}", values.len()));
        }
        if let Some(industry) = filter.industry.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            values.push(Value::Text(industry.to_string()));
            clauses.push(format!("industry = ?{}", values.len()));
        }
        if let Some(status) = filter.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            values.push(Value::Text(status.to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        values.push(Value::Integer(limit as i64));
        let limit_idx = values.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT inn FROM companies {where_sql} ORDER BY inn ASC LIMIT ?{limit_idx}"
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
