//! Textual profile output.
//!
//! The grammar is shared with the parser; every record line ends with `;`
//! and `#` starts a comment. Section order: header, allocation-coverage,
//! local/escape objects, underlying-object predictions, value predictions,
//! integer predictions, pointer residues.

use crate::errors::Result;
use crate::features::profile::application::profiler::{Profiler, MAGIC_INVALID};
use std::io::Write;

pub fn write_profile_text(p: &Profiler, out: &mut impl Write) -> Result<()> {
    writeln!(out, "BEGIN SPEC PRIV PROFILE")?;

    let c = &p.counters;
    writeln!(out, "# Event histogram:")?;
    writeln!(out, "# ---- AU registration")?;
    writeln!(out, "#  malloc {}", c.malloc)?;
    writeln!(out, "# realloc {}", c.realloc)?;
    writeln!(out, "#    free {}", c.free)?;
    writeln!(out, "#   const {}", c.constant)?;
    writeln!(out, "#  global {}", c.global)?;
    writeln!(out, "#   stack {}", c.stack)?;
    writeln!(out, "# ---- Context manipulation")?;
    writeln!(out, "#    +fcn {}", c.begin_fcn)?;
    writeln!(out, "#    -fcn {}", c.end_fcn)?;
    writeln!(out, "#   +loop {}", c.loop_entry)?;
    writeln!(out, "#   -loop {}", c.loop_exit)?;
    writeln!(out, "#    iter {}", c.loop_iter)?;
    writeln!(out, "# ---- Instrumentation")?;
    writeln!(out, "#     fuo {}", c.fuo)?;
    writeln!(out, "#   p int {}", c.pred_int)?;
    writeln!(out, "#   p ptr {}", c.pred_ptr)?;
    writeln!(out, "# residue {}", c.ptr_residue)?;
    writeln!(out, "# ignored {}", c.ignored_out_of_range)?;
    writeln!(out, "#")?;

    // Was the profile complete w.r.t. allocation/deallocation coverage?
    if p.possible_allocation_leaks.is_empty() {
        writeln!(out, "COMPLETE ALLOCATION INFO ;")?;
    }
    for fcn in &p.possible_allocation_leaks {
        writeln!(out, "INCOMPLETE ALLOCATION INFO {} ;", fcn)?;
    }

    // Local and escape records.
    for (site, ctx, _count) in p.escapes.local_records() {
        writeln!(out, "LOCAL OBJECT {} at context {} ;", site.0, p.arena().print(ctx))?;
    }
    for (site, ctx, count) in p.escapes.escape_records() {
        writeln!(
            out,
            "ESCAPE OBJECT {} at context {} COUNT {} ;",
            site.0,
            p.arena().print(ctx),
            count
        )?;
    }

    // Underlying-object predictions.
    let mut obj_keys: Vec<_> = p.obj_predictions.keys().collect();
    obj_keys.sort();
    for key in obj_keys {
        let set = &p.obj_predictions[key];
        if !set.is_worth_printing() {
            continue;
        }
        if set.is_bottom() {
            writeln!(out, "# PRED OBJ {} unpredictable", key.0)?;
            continue;
        }
        let obs = set.observations();
        writeln!(out, "PRED OBJ {} at {} : {}", key.0, p.arena().print(key.1), obs.len())?;
        for sample in obs {
            use crate::features::profile::infrastructure::live::PAuType;
            match sample.ty {
                PAuType::Unknown => writeln!(out, "AU UNMANAGED ;")?,
                PAuType::Null => writeln!(out, "AU NULL ;")?,
                ty => writeln!(
                    out,
                    "AU {} {} FROM CONTEXT {} OFFSET {} COUNT {} ;",
                    ty.tag(),
                    sample.name,
                    p.arena().print(sample.ctx),
                    sample.offset,
                    sample.frequency
                )?,
            }
        }
    }

    // Value predictions (poisoned slots are dropped).
    let mut val_keys: Vec<_> = p.value_predictions.keys().collect();
    val_keys.sort();
    for instr in val_keys {
        let v = p.value_predictions[instr];
        if v != MAGIC_INVALID {
            writeln!(out, "PRED VAL {} {} ;", instr, v)?;
        }
    }

    // Integer predictions.
    let mut int_keys: Vec<_> = p.int_predictions.keys().collect();
    int_keys.sort();
    for key in int_keys {
        let set = &p.int_predictions[key];
        if !set.is_worth_printing() || set.is_bottom() {
            continue;
        }
        let obs = set.observations();
        writeln!(out, "PRED INT {} at {} : {}", key.0, p.arena().print(key.1), obs.len())?;
        for sample in obs {
            writeln!(out, "INT {} COUNT {} ;", sample.value, sample.frequency)?;
        }
    }

    // Pointer residues.
    let mut res_keys: Vec<_> = p.residues.keys().collect();
    res_keys.sort();
    for key in res_keys {
        let rs = &p.residues[key];
        let members = rs.members();
        let rendered: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        writeln!(
            out,
            "PTR RESIDUES {} AT {} AS RESTRICTED {} SAMPLES OVER {} MEMBERS {{ {} }} ;",
            key.0,
            p.arena().print(key.1),
            rs.num_samples(),
            members.len(),
            rendered.join(" , ")
        )?;
    }

    writeln!(out, "END SPEC PRIV PROFILE")?;
    Ok(())
}

/// Convenience wrapper used by tests and tools.
pub fn write_profile(p: &Profiler, out: &mut impl Write) -> Result<()> {
    write_profile_text(p, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::profile::application::profiler::Profiler;

    #[test]
    fn test_delimiters_and_coverage() {
        let mut p = Profiler::new();
        p.func_entry("main");
        p.malloc("m", 0x1000, 16).unwrap();
        let mut buf = Vec::new();
        write_profile_text(&p, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("BEGIN SPEC PRIV PROFILE\n"));
        assert!(text.trim_end().ends_with("END SPEC PRIV PROFILE"));
        assert!(text.contains("COMPLETE ALLOCATION INFO ;"));
    }

    #[test]
    fn test_incomplete_allocation_info() {
        let mut p = Profiler::new();
        p.possible_allocation_leak("mystery_fcn");
        let mut buf = Vec::new();
        write_profile_text(&p, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("COMPLETE ALLOCATION INFO"));
        assert!(text.contains("INCOMPLETE ALLOCATION INFO mystery_fcn ;"));
    }

    #[test]
    fn test_residue_line_format() {
        let mut p = Profiler::new();
        p.pointer_residue("p", 0x1000);
        p.pointer_residue("p", 0x1004);
        let mut buf = Vec::new();
        write_profile_text(&p, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(
            "PTR RESIDUES p AT { TOP } AS RESTRICTED 2 SAMPLES OVER 2 MEMBERS { 0 , 4 } ;"
        ));
    }
}
