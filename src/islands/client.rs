//! Client-side discovery and scheduling rules.
//!
//! The browser bootstrap ([`ISLANDS_RUNTIME`], served at `/__runtime/islands.js`)
//! implements these rules in JavaScript. The same rules are modelled here so the
//! server can reason about a page (tests, export checks) without a browser:
//!
//! | Strategy  | With browser support                      | Fallback         |
//! |-----------|-------------------------------------------|------------------|
//! | `load`    | immediately                               | n/a              |
//! | `idle`    | `requestIdleCallback`                     | 2 s timeout      |
//! | `visible` | `IntersectionObserver`, threshold 0.1     | 3 s timeout      |

use std::collections::HashSet;
use std::time::Duration;

use tracing::warn;

use super::{Island, Strategy, discover_islands};

/// Delay used for `idle` islands when idle callbacks are unavailable.
pub const IDLE_FALLBACK: Duration = Duration::from_millis(2000);

/// Delay used for `visible` islands when intersection observers are unavailable.
pub const VISIBLE_FALLBACK: Duration = Duration::from_millis(3000);

/// Visible fraction that triggers hydration of a `visible` island.
pub const VISIBILITY_THRESHOLD: f32 = 0.1;

/// Browser features the bootstrap probes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub idle_callback: bool,
    pub intersection_observer: bool,
}

impl Capabilities {
    pub const MODERN: Self = Self {
        idle_callback: true,
        intersection_observer: true,
    };

    pub const LEGACY: Self = Self {
        idle_callback: false,
        intersection_observer: false,
    };
}

/// When an island's hydration fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    Immediate,
    IdleCallback,
    Visible { threshold: f32 },
    After(Duration),
}

/// Picks the trigger for `strategy` given the browser's `caps`.
pub fn trigger_for(strategy: Strategy, caps: Capabilities) -> Trigger {
    match strategy {
        Strategy::Load => Trigger::Immediate,
        Strategy::Idle if caps.idle_callback => Trigger::IdleCallback,
        Strategy::Idle => Trigger::After(IDLE_FALLBACK),
        Strategy::Visible if caps.intersection_observer => Trigger::Visible {
            threshold: VISIBILITY_THRESHOLD,
        },
        Strategy::Visible => Trigger::After(VISIBLE_FALLBACK),
    }
}

/// An island paired with its trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub island: Island,
    pub trigger: Trigger,
}

/// Discovers every island in `html` and schedules it. Malformed markers are
/// warned about and skipped.
pub fn plan(html: &str, caps: Capabilities) -> Vec<Scheduled> {
    discover_islands(html)
        .into_iter()
        .map(|island| Scheduled {
            trigger: trigger_for(island.strategy, caps),
            island,
        })
        .collect()
}

/// Result of a hydration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Hydrate,
    AlreadyHydrated,
    /// No element with the island's id; warned, not fatal.
    MissingTarget,
}

/// Enforces at-most-once hydration per island per page load.
#[derive(Debug, Default)]
pub struct HydrationTracker {
    hydrated: HashSet<String>,
}

impl HydrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an attempt to hydrate `id`; `target_present` says whether the
    /// wrapper element exists.
    pub fn attempt(&mut self, id: &str, target_present: bool) -> Attempt {
        if self.hydrated.contains(id) {
            return Attempt::AlreadyHydrated;
        }
        if !target_present {
            warn!(island = id, "island target not found");
            return Attempt::MissingTarget;
        }
        self.hydrated.insert(id.to_owned());
        Attempt::Hydrate
    }

    pub fn is_hydrated(&self, id: &str) -> bool {
        self.hydrated.contains(id)
    }
}

/// Browser bootstrap implementing island discovery and scheduling.
pub const ISLANDS_RUNTIME: &str = r#"const MARKER = /<!--__ISLAND_(LOAD|IDLE|VISIBLE)__:([^:]+):([^:]+):(.+?)-->/g;
const hydrated = new Set();

function extractIslands() {
  const html = document.documentElement.outerHTML;
  const islands = [];
  for (const m of html.matchAll(MARKER)) {
    try {
      islands.push({ id: m[2], component: m[3], strategy: m[1].toLowerCase(), props: JSON.parse(m[4]) });
    } catch {
      console.warn(`Failed to parse island ${m[2]}`);
    }
  }
  return islands;
}

async function hydrateIsland(island) {
  if (hydrated.has(island.id)) return;
  const target = document.getElementById(island.id);
  if (!target) {
    console.warn(`Island target #${island.id} not found`);
    return;
  }
  hydrated.add(island.id);
  try {
    const mod = await import(`/__hydrate?file=${encodeURIComponent(island.component)}`);
    const hydrate = mod.hydrate || (globalThis.__islet && globalThis.__islet.hydrate);
    if (!mod.default || typeof hydrate !== "function") {
      console.warn(`Component not exported from ${island.component}`);
      return;
    }
    hydrate(mod.default, island.props, target);
  } catch (err) {
    console.error(`Failed to hydrate island ${island.id}:`, err);
  }
}

function schedule(island) {
  switch (island.strategy) {
    case "load":
      hydrateIsland(island);
      break;
    case "idle":
      if ("requestIdleCallback" in window) requestIdleCallback(() => hydrateIsland(island));
      else setTimeout(() => hydrateIsland(island), 2000);
      break;
    case "visible": {
      const target = document.getElementById(island.id);
      if ("IntersectionObserver" in window && target) {
        const observer = new IntersectionObserver((entries) => {
          if (entries[0].isIntersecting) {
            observer.disconnect();
            hydrateIsland(island);
          }
        }, { threshold: 0.1 });
        observer.observe(target);
      } else {
        setTimeout(() => hydrateIsland(island), 3000);
      }
      break;
    }
  }
}

export function initializeIslands() {
  const run = () => extractIslands().forEach(schedule);
  if (document.readyState === "loading") document.addEventListener("DOMContentLoaded", run);
  else run();
}

initializeIslands();
"#;

/// Page hydration entry: reads the framework data payload and hydrates `#app`.
pub const HYDRATE_RUNTIME: &str = r#"export function getFrameworkData() {
  const el = document.getElementById("__FRAMEWORK_DATA__");
  if (!el) return null;
  try {
    return JSON.parse(el.textContent || "null");
  } catch {
    return null;
  }
}

export async function hydrateClient(entryPath) {
  const data = getFrameworkData();
  const mod = await import(entryPath);
  const root = document.getElementById("app");
  const hydrate = mod.hydrate || (globalThis.__islet && globalThis.__islet.hydrate);
  if (!root || !mod.default || typeof hydrate !== "function") return;
  hydrate(mod.default, { data: data?.data ?? null, params: data?.params ?? {}, query: data?.query ?? {} }, root);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::islands::encode_marker;
    use serde_json::json;

    fn page(strategies: &[(&str, Strategy)]) -> String {
        strategies
            .iter()
            .map(|(id, strategy)| {
                let marker = encode_marker(&Island {
                    id: (*id).into(),
                    component: "/c.tsx".into(),
                    strategy: *strategy,
                    props: json!({}),
                })
                .unwrap();
                format!(r#"{marker}<div id="{id}"></div>"#)
            })
            .collect()
    }

    #[test]
    fn modern_browser_triggers() {
        assert_eq!(trigger_for(Strategy::Load, Capabilities::MODERN), Trigger::Immediate);
        assert_eq!(trigger_for(Strategy::Idle, Capabilities::MODERN), Trigger::IdleCallback);
        assert_eq!(
            trigger_for(Strategy::Visible, Capabilities::MODERN),
            Trigger::Visible { threshold: 0.1 }
        );
    }

    #[test]
    fn legacy_fallback_delays() {
        assert_eq!(trigger_for(Strategy::Load, Capabilities::LEGACY), Trigger::Immediate);
        assert_eq!(
            trigger_for(Strategy::Idle, Capabilities::LEGACY),
            Trigger::After(Duration::from_secs(2))
        );
        assert_eq!(
            trigger_for(Strategy::Visible, Capabilities::LEGACY),
            Trigger::After(Duration::from_secs(3))
        );
    }

    #[test]
    fn plan_keeps_document_order() {
        let html = page(&[("a", Strategy::Visible), ("b", Strategy::Load)]);
        let planned = plan(&html, Capabilities::LEGACY);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].island.id, "a");
        assert_eq!(planned[1].trigger, Trigger::Immediate);
    }

    #[test]
    fn hydrates_at_most_once() {
        let mut tracker = HydrationTracker::new();
        assert_eq!(tracker.attempt("a", true), Attempt::Hydrate);
        assert_eq!(tracker.attempt("a", true), Attempt::AlreadyHydrated);
        assert!(tracker.is_hydrated("a"));
    }

    #[test]
    fn missing_target_is_not_recorded() {
        let mut tracker = HydrationTracker::new();
        assert_eq!(tracker.attempt("ghost", false), Attempt::MissingTarget);
        assert!(!tracker.is_hydrated("ghost"));
        assert_eq!(tracker.attempt("ghost", true), Attempt::Hydrate);
    }

    #[test]
    fn runtime_uses_the_same_marker_and_timings() {
        assert!(ISLANDS_RUNTIME.contains("__ISLAND_(LOAD|IDLE|VISIBLE)__"));
        assert!(ISLANDS_RUNTIME.contains("threshold: 0.1"));
        assert!(ISLANDS_RUNTIME.contains("2000"));
        assert!(ISLANDS_RUNTIME.contains("3000"));
        assert!(HYDRATE_RUNTIME.contains("__FRAMEWORK_DATA__"));
    }
}
