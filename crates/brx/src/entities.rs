//! 🧾 Billing entities: the things that cost money, and how their documents look.
//!
//! 🎬 *[a compute run ends. it leaves behind a bill, three log files, and a lingering sense of
//! having been more expensive than anyone expected.]*
//!
//! Each [`BillingEntity`] knows:
//! - its index name fragment (`run`, `run-billing-center`, `storage`) and therefore every
//!   index/alias name it owns
//! - the key a terms aggregation groups its documents by (`run_id`, `run_billing_center`,
//!   `storage_id`)
//! - which raw events feed it (runs feed both run entities)
//! - which numeric fields are summed on roll-up (everything else is carried from the latest doc)
//! - its index-mapping template
//! - how to turn a raw usage event into a day document
//!
//! 🏷️ Naming is `{prefix}-{entity}-{periodName}`. Physical indexes append `-{uuid}` so two
//! builds of the same period never collide. Aliases keep the bare name. Readers only use aliases.

use std::fmt;

use anyhow::{Result, bail};
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::common::EntityDocument;
use crate::frames::Period;
use crate::sources::RawUsageEvent;

/// 📅 Every document carries its billing day in this field, formatted `yyyy-MM-dd`.
pub const DATE_FIELD: &str = "created_date";

/// ⏱️ The exact event time, RFC 3339 with millis. Orders events that share a billing day.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// 🏦 Key fragment for runs billed to nobody in particular.
pub const UNASSIGNED_BILLING_CENTER: &str = "unassigned";

/// 🧾 Something we bill for. Closed set, one daily synchronizer and one merge chain each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum BillingEntity {
    Run,
    /// A run split by the billing center it was charged to. Keyed `{run_id}-{billing_center}`.
    RunBillingCenter,
    Storage,
}

impl BillingEntity {
    pub const ALL: [Self; 3] = [Self::Run, Self::RunBillingCenter, Self::Storage];

    /// 🏷️ The entity fragment of every index name this entity owns.
    pub const fn index_name(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::RunBillingCenter => "run-billing-center",
            Self::Storage => "storage",
        }
    }

    /// 🔑 The field the roll-up groups by. One merged document per distinct value.
    pub const fn key_field(self) -> &'static str {
        match self {
            Self::Run => "run_id",
            Self::RunBillingCenter => "run_billing_center",
            Self::Storage => "storage_id",
        }
    }

    /// 📡 The kind of raw event this entity is built from.
    pub const fn event_kind(self) -> Self {
        match self {
            Self::Run | Self::RunBillingCenter => Self::Run,
            Self::Storage => Self::Storage,
        }
    }

    /// ➕ Fields summed across a period. Everything else rides along from the latest document.
    pub const fn summed_fields(self) -> &'static [&'static str] {
        match self {
            Self::Run | Self::RunBillingCenter => &["cost", "usage_minutes"],
            Self::Storage => &["cost"],
        }
    }

    /// 🗺️ Index-mapping template used for every index of this entity, day through year.
    pub fn mapping(self) -> Value {
        let key_type = match self {
            Self::RunBillingCenter => "keyword",
            Self::Run | Self::Storage => "long",
        };
        let mut properties = Map::new();
        properties.insert(self.key_field().into(), json!({ "type": key_type }));
        properties.insert(
            DATE_FIELD.into(),
            json!({ "type": "date", "format": "yyyy-MM-dd" }),
        );
        properties.insert(TIMESTAMP_FIELD.into(), json!({ "type": "date" }));
        properties.insert("owner".into(), json!({ "type": "keyword" }));
        properties.insert("cost".into(), json!({ "type": "double" }));
        match self {
            Self::Run | Self::RunBillingCenter => {
                properties.insert("run_id".into(), json!({ "type": "long" }));
                for keyword in ["billing_center", "pipeline", "tool", "instance_type"] {
                    properties.insert(keyword.into(), json!({ "type": "keyword" }));
                }
                properties.insert("usage_minutes".into(), json!({ "type": "double" }));
            }
            Self::Storage => {
                for keyword in ["storage_name", "storage_type", "provider", "region"] {
                    properties.insert(keyword.into(), json!({ "type": "keyword" }));
                }
                properties.insert("usage_bytes".into(), json!({ "type": "long" }));
            }
        }
        json!({ "mappings": { "properties": properties } })
    }

    /// 📄 Turn one raw event into the document stored in its day index.
    ///
    /// The id is the event id when the source has one, otherwise `{key}-{epoch millis}`.
    /// Either way a replayed window overwrites instead of duplicating. The run and
    /// run-by-billing-center documents of one event share an id, but never an index.
    pub fn day_document(self, event: &RawUsageEvent) -> Result<EntityDocument> {
        let mut fields = Map::new();
        let (id, key) = match (self, event) {
            (Self::Run | Self::RunBillingCenter, RawUsageEvent::Run(run)) => {
                let key = match self {
                    Self::RunBillingCenter => {
                        let center = run
                            .billing_center
                            .as_deref()
                            .unwrap_or(UNASSIGNED_BILLING_CENTER);
                        let key = format!("{}-{center}", run.run_id);
                        fields.insert(self.key_field().into(), json!(key));
                        key
                    }
                    _ => run.run_id.to_string(),
                };
                fields.insert("run_id".into(), json!(run.run_id));
                fields.insert("owner".into(), json!(run.owner));
                fields.insert("billing_center".into(), json!(run.billing_center));
                fields.insert("pipeline".into(), json!(run.pipeline));
                fields.insert("tool".into(), json!(run.tool));
                fields.insert("instance_type".into(), json!(run.instance_type));
                fields.insert("usage_minutes".into(), json!(run.usage_minutes));
                fields.insert("cost".into(), json!(run.cost));
                (run.id.clone(), key)
            }
            (Self::Storage, RawUsageEvent::Storage(storage)) => {
                fields.insert("storage_id".into(), json!(storage.storage_id));
                fields.insert("owner".into(), json!(storage.owner));
                fields.insert("storage_name".into(), json!(storage.storage_name));
                fields.insert("storage_type".into(), json!(storage.storage_type));
                fields.insert("provider".into(), json!(storage.provider));
                fields.insert("region".into(), json!(storage.region));
                fields.insert("usage_bytes".into(), json!(storage.usage_bytes));
                fields.insert("cost".into(), json!(storage.cost));
                (storage.id.clone(), storage.storage_id.to_string())
            }
            (entity, other) => bail!(
                "💀 {entity} cannot file a {} event. Wrong department.",
                other.entity()
            ),
        };
        let timestamp = event.timestamp();
        fields.insert(
            DATE_FIELD.into(),
            json!(timestamp.date_naive().format("%Y-%m-%d").to_string()),
        );
        fields.insert(
            TIMESTAMP_FIELD.into(),
            json!(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        let id = id.unwrap_or_else(|| format!("{key}-{}", timestamp.timestamp_millis()));
        Ok(EntityDocument::new(id, fields))
    }
}

impl fmt::Display for BillingEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.index_name())
    }
}

/// 🏷️ `{prefix}-{entity}`: every index and alias of `entity` starts with this.
pub fn index_base(prefix: &str, entity: BillingEntity) -> String {
    format!("{prefix}-{}", entity.index_name())
}

/// 🏷️ `{prefix}-{entity}-{periodName}`: the alias readers use for `period`.
pub fn index_name(prefix: &str, entity: BillingEntity, period: &Period) -> String {
    format!("{}-{}", index_base(prefix, entity), period.name())
}

/// 🎲 A fresh physical index name behind `alias`. Never reused, never guessed.
pub fn unique_physical_name(alias: &str) -> String {
    format!("{alias}-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::MergingFrame;
    use crate::sources::{RunUsageEvent, StorageUsageEvent};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn run_event(id: Option<&str>) -> RawUsageEvent {
        RawUsageEvent::Run(RunUsageEvent {
            id: id.map(str::to_string),
            run_id: 7,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 1).unwrap(),
            owner: Some("alice".into()),
            billing_center: Some("genomics".into()),
            pipeline: None,
            tool: Some("bwa".into()),
            instance_type: Some("m5.large".into()),
            usage_minutes: 12.0,
            cost: 0.75,
        })
    }

    #[test]
    fn the_one_where_names_follow_the_house_rules() {
        let march = MergingFrame::Month.period_of(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        let alias = index_name("billing", BillingEntity::Run, &march);
        assert_eq!(alias, "billing-run-2024-03m");
        assert_eq!(index_base("billing", BillingEntity::Storage), "billing-storage");

        let physical = unique_physical_name(&alias);
        assert!(physical.starts_with("billing-run-2024-03m-"));
        assert_ne!(physical, unique_physical_name(&alias));
        assert_eq!(
            MergingFrame::Month.period_from_index_name("billing-run", &physical),
            Some(march)
        );
    }

    #[test]
    fn the_one_where_a_run_event_becomes_a_day_document() -> Result<()> {
        let document = BillingEntity::Run.day_document(&run_event(Some("evt-1")))?;
        assert_eq!(document.id.as_deref(), Some("evt-1"));
        assert_eq!(document.fields["created_date"], json!("2024-03-09"));
        assert_eq!(document.fields["run_id"], json!(7));
        assert_eq!(document.number("cost"), Some(0.75));
        assert_eq!(document.fields["pipeline"], Value::Null);
        Ok(())
    }

    #[test]
    fn the_one_where_anonymous_events_get_a_stable_id() -> Result<()> {
        let first = BillingEntity::Run.day_document(&run_event(None))?;
        let again = BillingEntity::Run.day_document(&run_event(None))?;
        assert_eq!(first.id, again.id);
        assert!(first.id.as_deref().is_some_and(|id| id.starts_with("7-")));
        Ok(())
    }

    #[test]
    fn the_one_where_storage_refuses_a_run_event() {
        assert!(BillingEntity::Storage.day_document(&run_event(None)).is_err());
        let storage = RawUsageEvent::Storage(StorageUsageEvent {
            id: None,
            storage_id: 3,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            owner: None,
            storage_name: Some("bucket".into()),
            storage_type: Some("S3".into()),
            provider: Some("AWS".into()),
            region: Some("eu-central-1".into()),
            usage_bytes: 1024,
            cost: 0.01,
        });
        assert!(BillingEntity::Run.day_document(&storage).is_err());
        assert!(BillingEntity::Storage.day_document(&storage).is_ok());
    }

    #[test]
    fn the_one_where_the_mapping_knows_the_key_and_the_date() {
        for entity in BillingEntity::ALL {
            let mapping = entity.mapping();
            let properties = &mapping["mappings"]["properties"];
            let key_type = if entity == BillingEntity::RunBillingCenter { "keyword" } else { "long" };
            assert_eq!(properties[entity.key_field()]["type"], json!(key_type));
            assert_eq!(properties[DATE_FIELD]["format"], json!("yyyy-MM-dd"));
            for field in entity.summed_fields() {
                assert_eq!(properties[*field]["type"], json!("double"));
            }
        }
    }

    #[test]
    fn the_one_where_a_run_is_split_by_billing_center() -> Result<()> {
        let document = BillingEntity::RunBillingCenter.day_document(&run_event(None))?;
        assert_eq!(document.fields["run_billing_center"], json!("7-genomics"));
        assert_eq!(document.fields["run_id"], json!(7));
        assert!(document.id.as_deref().is_some_and(|id| id.starts_with("7-genomics-")));

        let RawUsageEvent::Run(mut orphan) = run_event(Some("evt-2")) else {
            unreachable!("run_event builds runs");
        };
        orphan.billing_center = None;
        let document = BillingEntity::RunBillingCenter.day_document(&RawUsageEvent::Run(orphan))?;
        assert_eq!(document.fields["run_billing_center"], json!("7-unassigned"));
        assert_eq!(BillingEntity::RunBillingCenter.event_kind(), BillingEntity::Run);
        assert_eq!(
            index_base("billing", BillingEntity::RunBillingCenter),
            "billing-run-billing-center"
        );
        Ok(())
    }
}
