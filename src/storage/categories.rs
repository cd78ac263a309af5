use std::collections::BTreeSet;

use super::schema::Database;
use super::types::{Category, DatabaseError};
use crate::feed::validators;

/// Top-level Apple Podcasts categories, seeded at migration.
pub(crate) const DEFAULT_CATEGORIES: &[&str] = &[
    "Arts",
    "Business",
    "Comedy",
    "Education",
    "Fiction",
    "Government",
    "Health & Fitness",
    "History",
    "Kids & Family",
    "Leisure",
    "Music",
    "News",
    "Religion & Spirituality",
    "Science",
    "Society & Culture",
    "Sports",
    "Technology",
    "True Crime",
    "TV & Film",
];

/// Read-only snapshot of the `categories` table.
///
/// Built once before a batch and shared by every worker. The table only
/// changes through migrations or admin tooling, so invalidation is an
/// explicit [`CategoryCache::reload`].
#[derive(Debug, Clone, Default)]
pub struct CategoryCache {
    /// Each category with the slug tokens of its name.
    entries: Vec<(Category, BTreeSet<String>)>,
}

impl CategoryCache {
    pub async fn load(db: &Database) -> Result<Self, DatabaseError> {
        let rows: Vec<Category> =
            sqlx::query_as("SELECT id, name, slug FROM categories ORDER BY name")
                .fetch_all(&db.pool)
                .await?;

        let entries = rows
            .into_iter()
            .map(|category| {
                let tokens = validators::categories([category.name.as_str()]);
                (category, tokens)
            })
            .collect();

        Ok(Self { entries })
    }

    pub async fn reload(&mut self, db: &Database) -> Result<(), DatabaseError> {
        *self = Self::load(db).await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.entries.iter().map(|(category, _)| category)
    }

    /// IDs of every category whose name tokens all appear in `feed_categories`.
    ///
    /// `{"society", "culture", "history"}` matches both "Society & Culture"
    /// and "History".
    pub fn matching(&self, feed_categories: &BTreeSet<String>) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|(_, tokens)| !tokens.is_empty() && tokens.is_subset(feed_categories))
            .map(|(category, _)| category.id)
            .collect()
    }
}

impl Database {
    /// Categories currently assigned to a podcast, by name.
    pub async fn get_podcast_categories(
        &self,
        podcast_id: i64,
    ) -> Result<Vec<Category>, DatabaseError> {
        let rows = sqlx::query_as(
            r#"
            SELECT c.id, c.name, c.slug
            FROM categories c
            JOIN podcast_categories pc ON pc.category_id = c.id
            WHERE pc.podcast_id = ?
            ORDER BY c.name
        "#,
        )
        .bind(podcast_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
