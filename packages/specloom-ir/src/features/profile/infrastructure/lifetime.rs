//! Object-lifetime evidence: escapes, locals, and the short-lived sets.

use super::pctx::{PCtxArena, PCtxId};
use rustc_hash::{FxHashMap, FxHashSet};

/// Key identifying an allocation site in lifetime tables: the site's name
/// plus its creation context.
pub type SiteKey = (String, PCtxId);

/// Escape/local frequency tables.
///
/// A local report propagates through the enclosing contexts: an object
/// local to an iteration is also local to the surrounding function call.
/// An escape report at a context suppresses the local report there.
#[derive(Default)]
pub struct EscapeTable {
    escape_frequencies: FxHashMap<SiteKey, FxHashMap<PCtxId, u64>>,
    local_frequencies: FxHashMap<SiteKey, FxHashMap<PCtxId, u64>>,
}

impl EscapeTable {
    pub fn report_escape(&mut self, site: SiteKey, ctx: PCtxId) {
        *self.escape_frequencies.entry(site).or_default().entry(ctx).or_insert(0) += 1;
    }

    pub fn report_local(&mut self, arena: &PCtxArena, site: SiteKey, ctx: PCtxId) {
        let freqs = self.local_frequencies.entry(site).or_default();
        let mut cur = Some(ctx);
        while let Some(c) = cur {
            *freqs.entry(c).or_insert(0) += 1;
            cur = arena.parent(c);
        }
    }

    /// (site, ctx, count) local records, escapes filtered out.
    pub fn local_records(&self) -> Vec<(&SiteKey, PCtxId, u64)> {
        let mut out = Vec::new();
        for (site, freqs) in &self.local_frequencies {
            for (&ctx, &count) in freqs {
                let escaped = self
                    .escape_frequencies
                    .get(site)
                    .map(|e| e.contains_key(&ctx))
                    .unwrap_or(false);
                if !escaped {
                    out.push((site, ctx, count));
                }
            }
        }
        out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        out
    }

    pub fn escape_records(&self) -> Vec<(&SiteKey, PCtxId, u64)> {
        let mut out = Vec::new();
        for (site, freqs) in &self.escape_frequencies {
            for (&ctx, &count) in freqs {
                out.push((site, ctx, count));
            }
        }
        out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        out
    }
}

/// Short-lived classification for the target loop.
///
/// An allocation site is short-lived iff at *every* observed free the
/// object was allocated in the same invocation and iteration that freed it,
/// while inside the loop. One contrary observation disqualifies the site
/// permanently.
#[derive(Default)]
pub struct ShortLivedSets {
    short: FxHashSet<SiteKey>,
    long: FxHashSet<SiteKey>,
}

impl ShortLivedSets {
    pub fn observe_free(&mut self, site: SiteKey, same_iter_and_invoc_in_loop: bool) {
        if same_iter_and_invoc_in_loop {
            self.short.insert(site);
        } else {
            self.long.insert(site);
        }
    }

    pub fn is_short_lived(&self, site: &SiteKey) -> bool {
        self.short.contains(site) && !self.long.contains(site)
    }

    /// Sites that survived classification, sorted for stable output.
    pub fn short_lived(&self) -> Vec<&SiteKey> {
        let mut v: Vec<&SiteKey> =
            self.short.iter().filter(|s| !self.long.contains(*s)).collect();
        v.sort();
        v
    }
}
