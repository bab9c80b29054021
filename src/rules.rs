//! Authorization allow-list for injected requests.

use serde::{Deserialize, Serialize};

use crate::frame::Exchange;

const DEFAULT_ALLOW_STATIONS: [u8; 1] = [1];
const DEFAULT_ALLOW_FUNCTIONS: [u8; 4] = [1, 2, 3, 4];

/// One allow-list entry: a register range, optionally restricted to a set
/// of function codes and station ids. Empty `functions`/`stations` fall
/// back to the defaults above rather than meaning "match anything".
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub from: u16,
    #[serde(default)]
    pub to: u16,
    #[serde(default)]
    pub functions: Vec<u8>,
    #[serde(rename = "station", default)]
    pub stations: Vec<u8>,
}

/// Returns true iff some rule in `rules` authorizes `exchange`.
///
/// An empty rule list denies everything: there is no implicit allow.
pub fn check_rules(exchange: &Exchange, rules: &[Rule]) -> bool {
    let a1 = exchange.base;
    let a2 = exchange.base.wrapping_add(exchange.count).wrapping_sub(1);

    for rule in rules {
        let stations: &[u8] = if rule.stations.is_empty() {
            &DEFAULT_ALLOW_STATIONS
        } else {
            &rule.stations
        };
        if !stations.contains(&exchange.station) {
            continue;
        }

        let lower = rule.from;
        let upper = if rule.to == 0 { lower } else { rule.to };
        if a1 < lower || a1 > upper || a2 < lower || a2 > upper {
            continue;
        }

        let functions: &[u8] = if rule.functions.is_empty() {
            &DEFAULT_ALLOW_FUNCTIONS
        } else {
            &rule.functions
        };
        if !functions.contains(&exchange.function) {
            continue;
        }

        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<Rule> {
        vec![
            Rule {
                from: 30001,
                to: 39999,
                functions: vec![3, 4],
                stations: vec![],
            },
            Rule {
                from: 43110,
                to: 0,
                functions: vec![6],
                stations: vec![],
            },
            Rule {
                from: 43143,
                to: 43150,
                functions: vec![16],
                stations: vec![],
            },
        ]
    }

    fn exchange(base: u16, count: u16, function: u8) -> Exchange {
        Exchange {
            station: 1,
            base,
            count,
            function,
            ..Exchange::new(false)
        }
    }

    #[test]
    fn rule_table_matrix() {
        let rules = rules();
        let cases = [
            (1234, 1, 4, false),
            (30001, 1, 2, false),
            (30001, 1, 3, true),
            (30001, 1, 4, true),
            (30001, 1, 5, false),
            (43109, 1, 6, false),
            (43110, 1, 6, true),
            (43110, 1, 16, false),
            (43111, 1, 6, false),
            (43142, 2, 16, false),
            (43143, 1, 6, false),
            (43143, 1, 16, true),
            (43143, 8, 16, true),
            (43143, 9, 16, false),
            (43147, 4, 16, true),
            (43147, 5, 16, false),
            (43150, 1, 16, true),
            (43150, 2, 16, false),
        ];
        for (i, (base, count, function, expected)) in cases.into_iter().enumerate() {
            let ex = exchange(base, count, function);
            assert_eq!(
                check_rules(&ex, &rules),
                expected,
                "case {i}: base={base} count={count} function={function}"
            );
        }
    }

    #[test]
    fn broadcast_station_is_denied() {
        let rules = rules();
        let mut allowed = exchange(30001, 1, 4);
        allowed.station = 1;
        assert!(check_rules(&allowed, &rules));

        let mut broadcast = exchange(30001, 1, 4);
        broadcast.station = 0;
        assert!(!check_rules(&broadcast, &rules));
    }

    #[test]
    fn deny_by_default_with_no_rules() {
        let ex = exchange(1, 1, 3);
        assert!(!check_rules(&ex, &[]));
    }
}
