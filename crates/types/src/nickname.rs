// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashSet;

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "civil", "clever", "crisp", "daring", "eager", "fuzzy",
    "gentle", "grand", "humble", "jolly", "keen", "lively", "lucky", "mellow", "noble", "proud",
    "quiet", "rapid", "solid", "steady", "swift", "tidy", "vivid", "warm", "wise", "zesty",
];

const NOUNS: &[&str] = &[
    "albatross", "badger", "beacon", "breeze", "caravel", "comet", "condor", "coral", "cutter",
    "dolphin", "falcon", "fjord", "galleon", "harbor", "heron", "kestrel", "lagoon", "mangrove",
    "marlin", "meridian", "osprey", "pelican", "pennant", "reef", "schooner", "seagull", "sextant",
    "sloop", "tern", "tide",
];

/// Picks a random `adjective-noun` nickname not already present in `in_use`.
/// Falls back to a numeric suffix when the combination space is crowded.
pub fn random_nickname(in_use: &HashSet<String>) -> String {
    let mut rng = rand::rng();
    for _ in 0..64 {
        let candidate = format!(
            "{}-{}",
            ADJECTIVES[rng.random_range(0..ADJECTIVES.len())],
            NOUNS[rng.random_range(0..NOUNS.len())]
        );
        if !in_use.contains(&candidate) {
            return candidate;
        }
    }
    let mut index = in_use.len();
    loop {
        let candidate = format!(
            "{}-{}-{index}",
            ADJECTIVES[rng.random_range(0..ADJECTIVES.len())],
            NOUNS[rng.random_range(0..NOUNS.len())]
        );
        if !in_use.contains(&candidate) {
            return candidate;
        }
        index += 1;
    }
}
