//! Property-based tests for the identity fold.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;

use talenet_identity::{
    ABOUT_TYPE, Identity, IdentityStore, LogEvent, Projection, SKILL_ASSIGNMENT_TYPE, Scope,
    SubscriptionRegistry,
};

const AUTHORS: [&str; 3] = ["@alice", "@bob", "@carol"];
const SKILLS: [&str; 4] = ["%rust", "%go", "%design", "%ops"];

#[derive(Debug, Clone)]
enum Payload {
    Name(String),
    Assign(String),
    Unassign(String),
    Bogus,
}

// Strategy for one authored payload
fn payload() -> impl Strategy<Value = Payload> {
    let skill = || prop::sample::select(SKILLS.to_vec()).prop_map(str::to_string);
    prop_oneof![
        2 => "[A-Z][a-z]{1,8}".prop_map(Payload::Name),
        4 => skill().prop_map(Payload::Assign),
        3 => skill().prop_map(Payload::Unassign),
        1 => Just(Payload::Bogus),
    ]
}

// Strategy for a log: payloads spread over authors, numbered per author feed
fn log() -> impl Strategy<Value = Vec<LogEvent>> {
    prop::collection::vec((prop::sample::select(AUTHORS.to_vec()), payload()), 0..40).prop_map(|entries| {
        let mut sequences: HashMap<&str, u64> = HashMap::new();
        entries
            .into_iter()
            .map(|(author, payload)| {
                let sequence = sequences.entry(author).or_default();
                *sequence += 1;
                let content = match payload {
                    Payload::Name(name) => json!({"type": ABOUT_TYPE, "about": author, "name": name}),
                    Payload::Assign(skill) => {
                        json!({"type": SKILL_ASSIGNMENT_TYPE, "skillKey": skill, "action": "ASSIGN"})
                    }
                    Payload::Unassign(skill) => {
                        json!({"type": SKILL_ASSIGNMENT_TYPE, "skillKey": skill, "action": "UNASSIGN"})
                    }
                    Payload::Bogus => json!({"type": SKILL_ASSIGNMENT_TYPE, "skillKey": "%x", "action": "PROMOTE"}),
                };
                LogEvent {
                    id: format!("%{author}-{sequence}.sha256"),
                    author: author.to_string(),
                    sequence: *sequence,
                    timestamp: Utc::now(),
                    content,
                }
            })
            .collect()
    })
}

fn projection() -> Projection {
    Projection::new(
        IdentityStore::new(),
        SubscriptionRegistry::new(Scope::Identities),
        SKILL_ASSIGNMENT_TYPE,
    )
}

fn fold_all<'a>(events: impl IntoIterator<Item = &'a LogEvent>) -> Projection {
    let projection = projection();
    for event in events {
        projection.fold_logged(event);
    }
    projection
}

fn snapshot(projection: &Projection) -> Vec<Identity> {
    AUTHORS.iter().map(|key| projection.store().get(key)).collect()
}

// Replays the log by hand: last name wins, skills follow the final action per skill.
fn expected_skills(events: &[LogEvent], author: &str) -> Vec<String> {
    let mut last: HashMap<String, bool> = HashMap::new();
    for event in events.iter().filter(|e| e.author == author) {
        if event.content["type"] != SKILL_ASSIGNMENT_TYPE {
            continue;
        }
        let skill = event.content["skillKey"].as_str().unwrap_or_default().to_string();
        match event.content["action"].as_str() {
            Some("ASSIGN") => last.insert(skill, true),
            Some("UNASSIGN") => last.insert(skill, false),
            _ => None,
        };
    }
    let mut skills: Vec<String> = last.into_iter().filter(|(_, held)| *held).map(|(s, _)| s).collect();
    skills.sort();
    skills
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn same_log_same_identities(events in log()) {
        prop_assert_eq!(snapshot(&fold_all(&events)), snapshot(&fold_all(&events)));
    }

    #[test]
    fn refolding_a_log_changes_nothing(events in log()) {
        let projection = fold_all(&events);
        let before = snapshot(&projection);

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        projection.subscriptions().subscribe(None, Arc::new(move |_: &Identity| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for event in &events {
            if event.content["type"] != ABOUT_TYPE {
                projection.fold_logged(event);
            }
        }

        prop_assert_eq!(before, snapshot(&projection));
        prop_assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn skills_match_final_action_per_skill(events in log()) {
        let projection = fold_all(&events);
        for author in AUTHORS {
            let skills: Vec<String> = projection.store().get(author).skills().iter().cloned().collect();
            prop_assert_eq!(skills, expected_skills(&events, author));
        }
    }

    #[test]
    fn skills_independent_of_delivery_order(
        (events, shuffled) in log().prop_flat_map(|events| {
            let shuffled = Just(events.clone()).prop_shuffle();
            (Just(events), shuffled)
        })
    ) {
        let in_order = fold_all(&events);
        let out_of_order = fold_all(&shuffled);
        for author in AUTHORS {
            let in_order_profile = in_order.store().get(author);
            let out_of_order_profile = out_of_order.store().get(author);
            prop_assert_eq!(
                in_order_profile.skills(),
                out_of_order_profile.skills()
            );
        }
    }

    #[test]
    fn last_delivered_name_wins(events in log()) {
        let projection = fold_all(&events);
        for author in AUTHORS {
            let expected = events
                .iter()
                .filter(|e| e.author == author)
                .filter_map(|e| e.content.get("name").and_then(|n| n.as_str()))
                .last();
            let profile = projection.store().get(author);
            prop_assert_eq!(profile.name(), expected);
        }
    }
}
