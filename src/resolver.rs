//! Ranked resolution of a logical key's candidates against the live page.

use tracing::{debug, warn};

use crate::error::CandidateMiss;
use crate::page::{Locator, Page};

const UNKNOWN_CANDIDATE: &str = "UNKNOWN";

/// The candidate with the most matches, for keys that name a group of
/// same-purpose elements.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMatch {
    /// Addresses every match of the winning candidate.
    pub locator: Locator,
    pub count: usize,
}

/// Compile one candidate and count its matches.
pub async fn resolve_candidate(
    page: &dyn Page,
    candidate: &str,
) -> Result<(Locator, usize), CandidateMiss> {
    let locator = Locator::new(candidate);
    match page.count(&locator.spec).await {
        Ok(0) => Err(CandidateMiss::NoMatch),
        Ok(n) => Ok((locator, n)),
        Err(err) => Err(CandidateMiss::Engine(err.to_string())),
    }
}

fn log_miss(candidate: &str, miss: &CandidateMiss) {
    match miss {
        CandidateMiss::NoMatch => debug!("   candidate {:?}: {}", candidate, miss),
        CandidateMiss::Engine(_) => warn!("   candidate {:?}: {}", candidate, miss),
    }
}

/// First candidate, in declared order, that matches at least one element;
/// narrowed to its first match.
pub async fn first_existing_locator(page: &dyn Page, candidates: &[String]) -> Option<Locator> {
    for candidate in candidates {
        match resolve_candidate(page, candidate).await {
            Ok((locator, _)) => return Some(locator.first()),
            Err(miss) => log_miss(candidate, &miss),
        }
    }
    None
}

/// Candidate with the highest match count. Ties keep the earlier candidate.
pub async fn best_group_locator(page: &dyn Page, candidates: &[String]) -> Option<GroupMatch> {
    let mut best: Option<GroupMatch> = None;
    for candidate in candidates {
        match resolve_candidate(page, candidate).await {
            Ok((locator, count)) => {
                if best.as_ref().is_none_or(|b| count > b.count) {
                    best = Some(GroupMatch { locator, count });
                }
            }
            Err(miss) => log_miss(candidate, &miss),
        }
    }
    best
}

/// First existing match, or an unmatched locator built from the first
/// candidate so a later wait reports "not found" rather than a resolver error.
pub async fn get_locator(page: &dyn Page, candidates: &[String]) -> Locator {
    if let Some(locator) = first_existing_locator(page, candidates).await {
        return locator;
    }
    let fallback = candidates.first().map(String::as_str).unwrap_or_else(|| {
        warn!("   no candidates configured, using placeholder locator");
        UNKNOWN_CANDIDATE
    });
    Locator::new(fallback).first()
}
