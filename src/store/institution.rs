use sea_query::{Iden, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::Row;

use crate::core::Institution;

use super::{Result, SqliteStore};

#[derive(Iden)]
enum Institutions {
    Table,
    Id,
    Name,
    CreatedAt,
}

/// Row as persisted, for the CSV exporter.
pub struct InstitutionRow {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    /// Insert-or-update keyed by the upstream institution id.
    pub async fn save(&mut self, ins: &Institution) -> Result<()> {
        let (query, values) = Query::insert()
            .into_table(Institutions::Table)
            .columns([Institutions::Id, Institutions::Name])
            .values_panic(vec![ins.id.as_str().into(), ins.name.as_str().into()])
            .on_conflict(
                OnConflict::column(Institutions::Id)
                    .update_columns([Institutions::Name])
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    pub async fn list(&mut self) -> Result<Vec<Institution>> {
        let (query, values) = Query::select()
            .columns([Institutions::Id, Institutions::Name])
            .from(Institutions::Table)
            .order_by(Institutions::Name, sea_query::Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        let mut institutions = Vec::with_capacity(rows.len());
        for row in rows {
            institutions.push(Institution {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }

        Ok(institutions)
    }

    pub async fn dump(&mut self) -> Result<Vec<InstitutionRow>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM institutions ORDER BY name")
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(InstitutionRow {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                created_at: row.try_get("created_at")?,
            });
        }

        Ok(out)
    }
}
