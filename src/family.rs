use std::{collections::HashSet, fmt};

use log::debug;

use crate::{
    cache::IdentifierCache,
    entity::EntityType,
    mapper::Payload,
    value::{Record, Value},
};

/// Label on a directed participant-to-participant edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Relation {
    Mother,
    Father,
    Sibling,
    Child,
}

/// Relation of participant 2 to participant 1 implied by each label.
const REVERSE_RELATIONS: &[(Relation, Relation)] = &[
    (Relation::Mother, Relation::Child),
    (Relation::Father, Relation::Child),
    (Relation::Sibling, Relation::Sibling),
];

/// Edges synthesized from every family row, proband on the receiving end.
pub const PARENT_RELATIONS: &[Relation] = &[Relation::Mother, Relation::Father];

/// Family row column holding the proband's natural key.
pub const PROBAND_FIELD: &str = "proband";

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Mother => "mother",
            Relation::Father => "father",
            Relation::Sibling => "sibling",
            Relation::Child => "child",
        }
    }

    pub fn reverse(self) -> Option<Relation> {
        REVERSE_RELATIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, to)| *to)
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyEdge {
    pub participant1_id: String,
    pub participant2_id: String,
    pub relation: Relation,
}

impl FamilyEdge {
    /// Synthesized natural key: `<participant1>_<participant2>_<relation>`.
    pub fn natural_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.participant1_id, self.participant2_id, self.relation
        )
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            "participant1_id".into(),
            Some(Value::from(self.participant1_id.as_str())),
        );
        record.insert(
            "participant2_id".into(),
            Some(Value::from(self.participant2_id.as_str())),
        );
        record.insert(
            "participant1_to_participant2_relation".into(),
            Some(Value::from(self.relation.as_str())),
        );
        record.insert(
            "participant2_to_participant1_relation".into(),
            self.relation.reverse().map(|r| Value::from(r.as_str())),
        );
        record
    }
}

/// Builds parent-to-proband edges for every family row whose members are
/// already in the identifier cache. An edge with an empty or unresolved
/// endpoint is left out; the row's other edges are still produced. A trio
/// repeated across rows yields its edges once.
pub fn build_edges(rows: &[Payload], cache: &IdentifierCache, relations: &[Relation]) -> Vec<FamilyEdge> {
    let mut edges = Vec::new();
    let mut seen = HashSet::new();
    for row in rows {
        let Some(proband) = row.get(PROBAND_FIELD) else {
            debug!("Family row {} has no proband", row.natural_key());
            continue;
        };
        for relation in relations {
            let Some(relative) = row.get(relation.as_str()) else {
                continue;
            };
            let participant1 = cache.get(EntityType::Participant, relative);
            let participant2 = cache.get(EntityType::Participant, proband);
            match (participant1, participant2) {
                (Some(p1), Some(p2)) => {
                    let edge = FamilyEdge {
                        participant1_id: p1.to_string(),
                        participant2_id: p2.to_string(),
                        relation: *relation,
                    };
                    if seen.insert(edge.natural_key()) {
                        edges.push(edge);
                    }
                }
                _ => debug!(
                    "Family row {}: {relation} '{relative}' or proband '{proband}' not loaded",
                    row.natural_key()
                ),
            }
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;

    fn family_row(pairs: &[(&str, &str)]) -> Payload {
        let mut payload = Payload::new(EntityType::FamilyRelationship, Some("F1".into()));
        for (k, v) in pairs {
            payload.fields.insert(k.to_string(), Some(Value::from(*v)));
        }
        payload
    }

    fn cache() -> IdentifierCache {
        let mut cache = IdentifierCache::new(Box::new(MemoryStorage::new()));
        cache.put(EntityType::Participant, "M1", "PT_MOTHER01");
        cache.put(EntityType::Participant, "F1x", "PT_FATHER01");
        cache.put(EntityType::Participant, "P001", "PT_PROBAND1");
        cache
    }

    #[test]
    fn reverse_relations_come_from_lookup_table() {
        assert_eq!(Relation::Mother.reverse(), Some(Relation::Child));
        assert_eq!(Relation::Father.reverse(), Some(Relation::Child));
        assert_eq!(Relation::Sibling.reverse(), Some(Relation::Sibling));
        assert_eq!(Relation::Child.reverse(), None);
    }

    #[test]
    fn both_parents_yield_two_edges() {
        let rows = vec![family_row(&[
            ("mother", "M1"),
            ("father", "F1x"),
            ("proband", "P001"),
        ])];
        let edges = build_edges(&rows, &cache(), PARENT_RELATIONS);
        let labels: Vec<_> = edges.iter().map(|e| e.relation.as_str()).collect();
        assert_eq!(labels, vec!["mother", "father"]);
        assert!(edges.iter().all(|e| e.participant2_id == "PT_PROBAND1"));
        assert_eq!(edges[0].natural_key(), "PT_MOTHER01_PT_PROBAND1_mother");
    }

    #[test]
    fn missing_father_yields_one_edge() {
        let rows = vec![family_row(&[("mother", "M1"), ("proband", "P001")])];
        assert_eq!(build_edges(&rows, &cache(), PARENT_RELATIONS).len(), 1);

        let unresolved = vec![family_row(&[("mother", "M1"), ("father", "nobody"), ("proband", "P001")])];
        assert_eq!(build_edges(&unresolved, &cache(), PARENT_RELATIONS).len(), 1);
    }

    #[test]
    fn repeated_trio_yields_each_edge_once() {
        let trio = [("mother", "M1"), ("father", "F1x"), ("proband", "P001")];
        let rows = vec![family_row(&trio), family_row(&trio)];
        let edges = build_edges(&rows, &cache(), PARENT_RELATIONS);
        assert_eq!(edges.len(), 2);
        assert_ne!(edges[0].natural_key(), edges[1].natural_key());
    }

    #[test]
    fn missing_proband_yields_nothing() {
        let rows = vec![family_row(&[("mother", "M1"), ("father", "F1x")])];
        assert!(build_edges(&rows, &cache(), PARENT_RELATIONS).is_empty());
    }

    #[test]
    fn record_carries_both_directions() {
        let edge = FamilyEdge {
            participant1_id: "PT_A".into(),
            participant2_id: "PT_B".into(),
            relation: Relation::Father,
        };
        let record = edge.to_record();
        assert_eq!(
            record["participant1_to_participant2_relation"],
            Some(Value::from("father"))
        );
        assert_eq!(
            record["participant2_to_participant1_relation"],
            Some(Value::from("child"))
        );
    }
}
