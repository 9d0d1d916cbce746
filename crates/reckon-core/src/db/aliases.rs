//! Merchant alias operations

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::{parse_datetime, Database};
use crate::error::{Error, Result};
use crate::merchant::MerchantNormalizer;
use crate::models::MerchantAlias;

/// Default aliases: (observed spelling, canonical id, category, subcategory, essential)
const SEED_ALIASES: &[(&str, &str, Option<&str>, Option<&str>, bool)] = &[
    ("tesco", "tesco", Some("groceries"), Some("supermarket"), true),
    ("tesco stores", "tesco", Some("groceries"), Some("supermarket"), true),
    ("tesco express", "tesco", Some("groceries"), Some("supermarket"), true),
    ("sainsburys", "sainsburys", Some("groceries"), Some("supermarket"), true),
    ("amazon", "amazon", Some("shopping"), Some("online"), false),
    ("amzn mktp", "amazon", Some("shopping"), Some("online"), false),
    ("amzn mktp uk", "amazon", Some("shopping"), Some("online"), false),
    ("amazon uk", "amazon", Some("shopping"), Some("online"), false),
    ("apple", "apple", Some("shopping"), Some("electronics"), false),
    ("apple bill", "apple", Some("subscriptions"), Some("software"), false),
    ("uber", "uber", Some("transport"), Some("taxi"), false),
    ("uber trip", "uber", Some("transport"), Some("taxi"), false),
    ("uber eats", "uber eats", Some("dining"), Some("delivery"), false),
    ("deliveroo", "deliveroo", Some("dining"), Some("delivery"), false),
    ("netflix", "netflix", Some("subscriptions"), Some("streaming"), false),
    ("spotify", "spotify", Some("subscriptions"), Some("music"), false),
];

impl Database {
    /// Seed the default alias table (idempotent - keeps user edits)
    pub fn seed_merchant_aliases(&self) -> Result<usize> {
        let conn = self.conn()?;
        let mut added = 0;
        for (alias, canonical, category, subcategory, essential) in SEED_ALIASES {
            added += conn.execute(
                "INSERT INTO merchant_aliases (alias, canonical_id, category, subcategory, essential, source)
                 VALUES (?, ?, ?, ?, ?, 'seed')
                 ON CONFLICT(alias) DO NOTHING",
                params![alias, canonical, category, subcategory, essential],
            )?;
        }
        if added > 0 {
            info!(added, "Seeded merchant aliases");
        }
        Ok(added)
    }

    /// Add or replace a user alias
    ///
    /// The alias is stored in the merchant normalizer's cleaned form; lookups
    /// are case-insensitive.
    pub fn add_merchant_alias(
        &self,
        alias: &str,
        canonical_id: &str,
        category: Option<&str>,
        subcategory: Option<&str>,
        essential: bool,
    ) -> Result<i64> {
        let alias = MerchantNormalizer::clean(alias);
        let canonical_id = canonical_id.trim().to_lowercase();
        if alias.is_empty() || canonical_id.is_empty() {
            return Err(Error::InvalidData(
                "Alias and canonical id must not be empty".to_string(),
            ));
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO merchant_aliases (alias, canonical_id, category, subcategory, essential, source)
             VALUES (?, ?, ?, ?, ?, 'user')
             ON CONFLICT(alias) DO UPDATE SET canonical_id = excluded.canonical_id,
                category = excluded.category, subcategory = excluded.subcategory,
                essential = excluded.essential, source = 'user'",
            params![alias, canonical_id, category, subcategory, essential],
        )?;
        let id = conn.query_row(
            "SELECT id FROM merchant_aliases WHERE alias = ?",
            params![alias],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// List all aliases
    pub fn list_merchant_aliases(&self) -> Result<Vec<MerchantAlias>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, alias, canonical_id, category, subcategory, essential, source, created_at
             FROM merchant_aliases ORDER BY canonical_id, alias",
        )?;
        let aliases = stmt
            .query_map([], Self::row_to_alias)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(aliases)
    }

    /// Alias → canonical id map, keys lowercased
    pub fn load_alias_map(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT alias, canonical_id FROM merchant_aliases")?;
        let map = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?.to_lowercase(), row.get(1)?))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(map)
    }

    /// Category fields recorded for a canonical merchant, if any alias carries them
    pub fn merchant_category(
        &self,
        canonical_id: &str,
    ) -> Result<Option<(String, Option<String>, bool)>> {
        let conn = self.conn()?;
        let category = conn
            .query_row(
                "SELECT category, subcategory, essential FROM merchant_aliases
                 WHERE canonical_id = ? AND category IS NOT NULL
                 ORDER BY source = 'user' DESC, id LIMIT 1",
                params![canonical_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(category)
    }

    fn row_to_alias(row: &rusqlite::Row) -> rusqlite::Result<MerchantAlias> {
        let created_at: String = row.get(7)?;
        Ok(MerchantAlias {
            id: row.get(0)?,
            alias: row.get(1)?,
            canonical_id: row.get(2)?,
            category: row.get(3)?,
            subcategory: row.get(4)?,
            essential: row.get(5)?,
            source: row.get(6)?,
            created_at: parse_datetime(&created_at),
        })
    }
}
