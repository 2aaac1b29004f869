//! Tag resolution against project-scoped vocabularies.
//!
//! Exact resolution runs unattended during tag extraction: a tag links to the
//! dictionary entry owning a variation with the tag's literal text, looked up
//! only in dictionaries the project selected and only among dictionaries
//! whose type equals the tag's translated type. Fuzzy suggestion is the
//! on-demand, human-reviewed fallback and never assigns anything itself.

use anyhow::Context;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::{Config, ResolutionConfig};
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{PageTag, ProjectConfig};
use crate::projects;

/// One variation in the project's scope.
#[derive(Debug, Clone)]
pub struct ScopedVariation {
    pub variation_id: i64,
    pub text: String,
    pub entry_id: i64,
    pub entry_label: String,
    pub dictionary_id: i64,
}

/// Outcome of exact resolution for one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Entry { entry_id: i64, ambiguous: bool },
    Date(i64),
    Unresolved,
    /// The tag's type is on the project's ignored list.
    IgnoredType,
}

/// Vocabulary snapshot for one project, loaded once per job.
#[derive(Debug, Default)]
pub struct Vocabulary {
    /// Dictionary type -> variations, ordered by entry id then variation id.
    by_type: HashMap<String, Vec<ScopedVariation>>,
    /// Date text -> lowest date variation id.
    dates: HashMap<String, i64>,
}

impl Vocabulary {
    /// Load the variations of the project's selected dictionaries and all
    /// date variations.
    pub async fn load(pool: &SqlitePool, project: &ProjectConfig) -> PipelineResult<Self> {
        let mut vocabulary = Vocabulary::default();

        if !project.selected_dictionaries.is_empty() {
            let placeholders = vec!["?"; project.selected_dictionaries.len()].join(", ");
            let sql = format!(
                r#"
                SELECT v.id AS variation_id, v.variation, e.id AS entry_id, e.label AS entry_label,
                       d.id AS dictionary_id, d.type AS dictionary_type
                FROM variations v
                JOIN dictionary_entries e ON e.id = v.entry_id
                JOIN dictionaries d ON d.id = e.dictionary_id
                WHERE d.id IN ({})
                ORDER BY e.id, v.id
                "#,
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in &project.selected_dictionaries {
                query = query.bind(*id);
            }
            for row in query.fetch_all(pool).await? {
                let dictionary_type: String = row.get("dictionary_type");
                vocabulary
                    .by_type
                    .entry(dictionary_type)
                    .or_default()
                    .push(ScopedVariation {
                        variation_id: row.get("variation_id"),
                        text: row.get("variation"),
                        entry_id: row.get("entry_id"),
                        entry_label: row.get("entry_label"),
                        dictionary_id: row.get("dictionary_id"),
                    });
            }
        }

        let dates = sqlx::query("SELECT id, variation FROM date_variations ORDER BY id")
            .fetch_all(pool)
            .await?;
        for row in dates {
            let text: String = row.get("variation");
            vocabulary.dates.entry(text).or_insert(row.get("id"));
        }

        Ok(vocabulary)
    }

    /// Variations of one dictionary type within scope.
    pub fn scoped(&self, dictionary_type: &str) -> &[ScopedVariation] {
        self.by_type
            .get(dictionary_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Exact resolution. When several entries share the text, the lowest
    /// entry id (then variation id) wins and the result is flagged ambiguous.
    pub fn resolve(&self, project: &ProjectConfig, variation: &str, tag_type: &str) -> Resolution {
        if project.is_ignored_type(tag_type) {
            return Resolution::IgnoredType;
        }
        if project.is_date_type(tag_type) {
            return match self.dates.get(variation) {
                Some(id) => Resolution::Date(*id),
                None => Resolution::Unresolved,
            };
        }

        let mut matches = self
            .scoped(project.translate(tag_type))
            .iter()
            .filter(|v| v.text == variation);
        let Some(first) = matches.next() else {
            return Resolution::Unresolved;
        };
        let ambiguous = matches.any(|v| v.entry_id != first.entry_id);
        Resolution::Entry {
            entry_id: first.entry_id,
            ambiguous,
        }
    }

    /// Ranked fuzzy candidates for a tag, one per dictionary entry.
    pub fn suggest(
        &self,
        project: &ProjectConfig,
        variation: &str,
        tag_type: &str,
        settings: &ResolutionConfig,
    ) -> Vec<Suggestion> {
        if project.is_ignored_type(tag_type) || project.is_date_type(tag_type) {
            return Vec::new();
        }

        let mut best: HashMap<i64, Suggestion> = HashMap::new();
        for candidate in self.scoped(project.translate(tag_type)) {
            let score = similarity(variation, &candidate.text);
            let strong = u32::from(score >= settings.strong_match_threshold);
            let slot = best.entry(candidate.entry_id).or_insert_with(|| Suggestion {
                entry_id: candidate.entry_id,
                entry_label: candidate.entry_label.clone(),
                dictionary_id: candidate.dictionary_id,
                variation_id: candidate.variation_id,
                variation: candidate.text.clone(),
                score,
                strong_matches: 0,
            });
            slot.strong_matches += strong;
            if score > slot.score {
                slot.score = score;
                slot.variation_id = candidate.variation_id;
                slot.variation = candidate.text.clone();
            }
        }

        let mut ranked: Vec<Suggestion> = best.into_values().collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then(a.entry_id.cmp(&b.entry_id)));
        ranked.truncate(settings.suggestion_limit);
        ranked
    }
}

/// Similarity ratio in `0..=100`.
pub fn similarity(a: &str, b: &str) -> u8 {
    (strsim::normalized_levenshtein(a, b) * 100.0).round() as u8
}

/// A fuzzy candidate: the best-scoring variation of one entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Suggestion {
    pub entry_id: i64,
    pub entry_label: String,
    pub dictionary_id: i64,
    pub variation_id: i64,
    pub variation: String,
    pub score: u8,
    /// Variations of this entry scoring at or above the strong-match threshold.
    pub strong_matches: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagSuggestions {
    pub tag: PageTag,
    pub dictionary_type: String,
    pub suggestions: Vec<Suggestion>,
}

/// Load a tag together with the project it belongs to.
pub async fn load_tag(pool: &SqlitePool, tag_id: i64) -> PipelineResult<Option<(PageTag, i64)>> {
    let row = sqlx::query(
        r#"
        SELECT t.id, t.page_id, t.variation, t.variation_type, t.additional_json,
               t.dictionary_entry_id, t.date_variation_id, d.project_id
        FROM page_tags t
        JOIN pages p ON p.id = t.page_id
        JOIN documents d ON d.id = p.document_id
        WHERE t.id = ?
        "#,
    )
    .bind(tag_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let additional: String = row.get("additional_json");
    let tag = PageTag {
        id: row.get("id"),
        page_id: row.get("page_id"),
        variation: row.get("variation"),
        variation_type: row.get("variation_type"),
        additional_information: serde_json::from_str(&additional)
            .context("tag carries invalid additional information")?,
        dictionary_entry_id: row.get("dictionary_entry_id"),
        date_variation_id: row.get("date_variation_id"),
    };
    Ok(Some((tag, row.get("project_id"))))
}

/// Fuzzy candidates for one stored tag. `None` when the tag does not exist.
pub async fn suggest_for_tag(
    pool: &SqlitePool,
    settings: &ResolutionConfig,
    tag_id: i64,
) -> PipelineResult<Option<TagSuggestions>> {
    let Some((tag, project_id)) = load_tag(pool, tag_id).await? else {
        return Ok(None);
    };
    let project = projects::load_project_config(pool, project_id).await?;
    let vocabulary = Vocabulary::load(pool, &project).await?;
    let suggestions = vocabulary.suggest(&project, &tag.variation, &tag.variation_type, settings);
    Ok(Some(TagSuggestions {
        dictionary_type: project.translate(&tag.variation_type).to_string(),
        tag,
        suggestions,
    }))
}

/// Link a tag to a dictionary entry chosen by an operator.
///
/// The entry must sit in a dictionary the tag's project selected, and that
/// dictionary's type must equal the tag's translated type.
pub async fn assign_tag_to_entry(
    pool: &SqlitePool,
    tag_id: i64,
    entry_id: i64,
    user: &str,
) -> PipelineResult<()> {
    if user.trim().is_empty() {
        return Err(PipelineError::Configuration(
            "an acting user is required".to_string(),
        ));
    }
    let (tag, project_id) = load_tag(pool, tag_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("tag {}", tag_id)))?;
    let project = projects::load_project_config(pool, project_id).await?;

    let entry = sqlx::query(
        r#"
        SELECT d.id AS dictionary_id, d.type AS dictionary_type
        FROM dictionary_entries e JOIN dictionaries d ON d.id = e.dictionary_id
        WHERE e.id = ?
        "#,
    )
    .bind(entry_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| PipelineError::NotFound(format!("entry {}", entry_id)))?;

    let dictionary_id: i64 = entry.get("dictionary_id");
    let dictionary_type: String = entry.get("dictionary_type");
    if !project.selected_dictionaries.contains(&dictionary_id) {
        return Err(PipelineError::Configuration(format!(
            "entry {} belongs to a dictionary project {} does not use",
            entry_id, project_id
        )));
    }
    let expected = project.translate(&tag.variation_type);
    if dictionary_type != expected {
        return Err(PipelineError::Configuration(format!(
            "entry {} has type '{}', tag {} needs '{}'",
            entry_id, dictionary_type, tag_id, expected
        )));
    }

    sqlx::query(
        "UPDATE page_tags SET dictionary_entry_id = ?, modified_by = ?, updated_at = ? WHERE id = ?",
    )
    .bind(entry_id)
    .bind(user)
    .bind(chrono::Utc::now().timestamp())
    .bind(tag_id)
    .execute(pool)
    .await?;

    if tag.dictionary_entry_id.is_some_and(|old| old != entry_id) {
        warn!(tag_id, entry_id, "replaced an existing tag assignment");
    }
    info!(tag_id, entry_id, user, "tag assigned");
    Ok(())
}

/// CLI entry point for `suggest`.
pub async fn run_suggest(config: &Config, tag_id: i64) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let result = suggest_for_tag(&pool, &config.resolution, tag_id).await;
    pool.close().await;
    let Some(found) = result? else {
        anyhow::bail!("tag not found: {}", tag_id);
    };

    println!(
        "Tag #{} \"{}\" ({} -> {})",
        found.tag.id, found.tag.variation, found.tag.variation_type, found.dictionary_type
    );
    if let Some(entry) = found.tag.dictionary_entry_id {
        println!("Currently linked to entry {}", entry);
    }
    if found.suggestions.is_empty() {
        println!("No candidates.");
        return Ok(());
    }
    println!();
    println!(
        "  {:>5}  {:<8} {:<30} {:<30} {:>6}",
        "SCORE", "ENTRY", "LABEL", "VARIATION", "STRONG"
    );
    for s in &found.suggestions {
        println!(
            "  {:>5}  {:<8} {:<30} {:<30} {:>6}",
            s.score, s.entry_id, s.entry_label, s.variation, s.strong_matches
        );
    }
    Ok(())
}

/// CLI entry point for `assign`.
pub async fn run_assign(config: &Config, tag_id: i64, entry_id: i64, user: &str) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let result = assign_tag_to_entry(&pool, tag_id, entry_id, user).await;
    pool.close().await;
    result?;
    println!("Tag {} linked to entry {}.", tag_id, entry_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variation(variation_id: i64, entry_id: i64, text: &str) -> ScopedVariation {
        ScopedVariation {
            variation_id,
            text: text.to_string(),
            entry_id,
            entry_label: format!("entry {}", entry_id),
            dictionary_id: 1,
        }
    }

    fn project() -> ProjectConfig {
        let mut project = ProjectConfig::default();
        project
            .tag_type_translator
            .insert("place".to_string(), "city".to_string());
        project.ignored_tag_types.insert("abbrev".to_string());
        project.date_tag_types.insert("date".to_string());
        project
    }

    fn vocabulary(variations: Vec<ScopedVariation>) -> Vocabulary {
        let mut vocabulary = Vocabulary::default();
        vocabulary.by_type.insert("city".to_string(), variations);
        vocabulary.dates.insert("3. März 1848".to_string(), 9);
        vocabulary
    }

    #[test]
    fn exact_match_uses_translated_type() {
        let vocab = vocabulary(vec![variation(1, 10, "Wien")]);
        assert_eq!(
            vocab.resolve(&project(), "Wien", "place"),
            Resolution::Entry {
                entry_id: 10,
                ambiguous: false
            }
        );
        // Untranslated types look up their own name.
        assert_eq!(vocab.resolve(&project(), "Wien", "person"), Resolution::Unresolved);
    }

    #[test]
    fn ambiguous_match_prefers_lowest_entry() {
        let vocab = vocabulary(vec![variation(5, 10, "Wien"), variation(3, 12, "Wien")]);
        assert_eq!(
            vocab.resolve(&project(), "Wien", "place"),
            Resolution::Entry {
                entry_id: 10,
                ambiguous: true
            }
        );
    }

    #[test]
    fn special_types_bypass_dictionaries() {
        let vocab = vocabulary(vec![variation(1, 10, "Wien")]);
        assert_eq!(vocab.resolve(&project(), "Wien", "abbrev"), Resolution::IgnoredType);
        assert_eq!(
            vocab.resolve(&project(), "3. März 1848", "date"),
            Resolution::Date(9)
        );
        assert_eq!(vocab.resolve(&project(), "1848", "date"), Resolution::Unresolved);
    }

    #[test]
    fn suggestions_are_ranked_and_limited() {
        let vocab = vocabulary(vec![
            variation(1, 1, "Venn"),
            variation(2, 2, "Wine"),
            variation(3, 3, "Wein"),
            variation(4, 4, "Wien"),
        ]);
        let settings = ResolutionConfig {
            suggestion_limit: 3,
            strong_match_threshold: 80,
        };
        let ranked = vocab.suggest(&project(), "Wien", "place", &settings);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].variation, "Wien");
        assert_eq!(ranked[0].score, 100);
        assert_eq!(ranked[0].strong_matches, 1);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn suggestions_group_variations_per_entry() {
        let vocab = vocabulary(vec![
            variation(1, 7, "Wien"),
            variation(2, 7, "Wienn"),
            variation(3, 8, "Vienna"),
        ]);
        let ranked = vocab.suggest(&project(), "Wien", "place", &ResolutionConfig::default());
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].entry_id, 7);
        assert_eq!(ranked[0].variation_id, 1);
        assert_eq!(ranked[0].strong_matches, 2);
    }

    #[test]
    fn similarity_is_a_percentage() {
        assert_eq!(similarity("Wien", "Wien"), 100);
        assert_eq!(similarity("Wien", "Wein"), 50);
        assert_eq!(similarity("", "Wien"), 0);
    }
}
