//! Recursive-descent profile parser.
//!
//! Consumes the grammar the writer emits and drives a `SemanticAction`.
//! Names in the profile are resolved against the module IR: functions and
//! globals by name, instructions by their (unique) value name.

use crate::errors::{Result, SpecloomError};
use crate::features::context::{AuKind, CtxId, CtxStep, Int, Ptr};
use crate::features::profile::ports::SemanticAction;
use crate::shared::models::{BlockId, FcnId, InstrId, ModuleIr, Opcode, ValueRef};

pub struct ProfileParser<'ir> {
    ir: &'ir ModuleIr,
}

/// Callee names treated as heap allocators when classifying AU sites.
fn is_allocator(name: &str) -> bool {
    matches!(name, "malloc" | "calloc" | "realloc" | "xalloc" | "valloc" | "memalign")
}

struct Tokens {
    toks: Vec<String>,
    pos: usize,
    line_of: Vec<usize>,
}

impl Tokens {
    fn new(text: &str) -> Self {
        let mut toks = Vec::new();
        let mut line_of = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                continue;
            }
            for t in trimmed.split_whitespace() {
                toks.push(t.to_string());
                line_of.push(lineno + 1);
            }
        }
        Tokens { toks, pos: 0, line_of }
    }

    fn line(&self) -> usize {
        self.line_of.get(self.pos).copied().unwrap_or(0)
    }

    fn peek(&self) -> Option<&str> {
        self.toks.get(self.pos).map(|s| s.as_str())
    }

    /// If the next token equals `keyword`, consume it.
    fn test(&mut self, keyword: &str) -> bool {
        if self.peek() == Some(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume the next token; error unless it equals `keyword`.
    fn expect(&mut self, keyword: &str) -> Result<()> {
        let line = self.line();
        match self.toks.get(self.pos) {
            Some(t) if t == keyword => {
                self.pos += 1;
                Ok(())
            }
            Some(t) => Err(SpecloomError::ProfileParse {
                line,
                message: format!("expected `{}`, found `{}`", keyword, t),
            }),
            None => Err(SpecloomError::ProfileParse {
                line,
                message: format!("expected `{}`, found end of profile", keyword),
            }),
        }
    }

    /// Consume an arbitrary token.
    fn consume(&mut self, desc: &str) -> Result<String> {
        let line = self.line();
        self.toks
            .get(self.pos)
            .cloned()
            .map(|t| {
                self.pos += 1;
                t
            })
            .ok_or_else(|| SpecloomError::ProfileParse {
                line,
                message: format!("expected {}, found end of profile", desc),
            })
    }

    fn consume_u64(&mut self, desc: &str) -> Result<u64> {
        let line = self.line();
        let t = self.consume(desc)?;
        t.parse().map_err(|_| SpecloomError::ProfileParse {
            line,
            message: format!("expected {} (integer), found `{}`", desc, t),
        })
    }

    fn err(&self, message: impl Into<String>) -> SpecloomError {
        SpecloomError::ProfileParse { line: self.line(), message: message.into() }
    }
}

impl<'ir> ProfileParser<'ir> {
    pub fn new(ir: &'ir ModuleIr) -> Self {
        ProfileParser { ir }
    }

    pub fn parse(&self, text: &str, sema: &mut dyn SemanticAction) -> Result<()> {
        let mut t = Tokens::new(text);
        sema.sem_set_valid(false);

        t.expect("BEGIN")?;
        t.expect("SPEC")?;
        t.expect("PRIV")?;
        t.expect("PROFILE")?;

        loop {
            if t.test("END") {
                t.expect("SPEC")?;
                t.expect("PRIV")?;
                t.expect("PROFILE")?;
                sema.sem_set_valid(true);
                return Ok(());
            } else if t.test("COMPLETE") {
                t.expect("ALLOCATION")?;
                t.expect("INFO")?;
                t.expect(";")?;
                sema.sem_complete_allocation_info(true, None);
            } else if t.test("INCOMPLETE") {
                t.expect("ALLOCATION")?;
                t.expect("INFO")?;
                let fcn = t.consume("function name")?;
                t.expect(";")?;
                sema.sem_complete_allocation_info(false, Some(&fcn));
            } else if t.test("LOCAL") {
                self.parse_local_object(&mut t, sema)?;
            } else if t.test("ESCAPE") {
                self.parse_escape_object(&mut t, sema)?;
            } else if t.test("PRED") {
                self.parse_prediction(&mut t, sema)?;
            } else if t.test("PTR") {
                self.parse_residues(&mut t, sema)?;
            } else {
                let tok = t.consume("statement keyword")?;
                return Err(t.err(format!("unknown statement `{}`", tok)));
            }
        }
    }

    fn parse_local_object(&self, t: &mut Tokens, sema: &mut dyn SemanticAction) -> Result<()> {
        t.expect("OBJECT")?;
        let name = t.consume("allocation site name")?;
        t.expect("at")?;
        t.expect("context")?;
        let ctx = self.parse_ctx(t, sema)?;
        t.expect(";")?;
        let au = self.resolve_site_au(t, &name, ctx, sema)?;
        sema.sem_local_object(au, ctx);
        Ok(())
    }

    fn parse_escape_object(&self, t: &mut Tokens, sema: &mut dyn SemanticAction) -> Result<()> {
        t.expect("OBJECT")?;
        let name = t.consume("allocation site name")?;
        t.expect("at")?;
        t.expect("context")?;
        let ctx = self.parse_ctx(t, sema)?;
        t.expect("COUNT")?;
        let count = t.consume_u64("count")?;
        t.expect(";")?;
        let au = self.resolve_site_au(t, &name, ctx, sema)?;
        sema.sem_escape_object(au, ctx, count);
        Ok(())
    }

    fn parse_prediction(&self, t: &mut Tokens, sema: &mut dyn SemanticAction) -> Result<()> {
        if t.test("OBJ") {
            let name = t.consume("value name")?;
            t.expect("at")?;
            let ctx = self.parse_ctx(t, sema)?;
            t.expect(":")?;
            let n = t.consume_u64("sample count")?;
            let mut ptrs = Vec::with_capacity(n as usize);
            for _ in 0..n {
                ptrs.push(self.parse_au_sample(t, sema)?);
            }
            let value = self.resolve_value(t, &name)?;
            sema.sem_obj_predict(value, ctx, ptrs);
            Ok(())
        } else if t.test("VAL") {
            let name = t.consume("load-site name")?;
            let value = t.consume_u64("predicted value")?;
            t.expect(";")?;
            let site = self.resolve_value(t, &name)?;
            sema.sem_val_predict(site, value);
            Ok(())
        } else if t.test("INT") {
            let name = t.consume("value name")?;
            t.expect("at")?;
            let ctx = self.parse_ctx(t, sema)?;
            t.expect(":")?;
            let n = t.consume_u64("sample count")?;
            let mut ints = Vec::with_capacity(n as usize);
            for _ in 0..n {
                t.expect("INT")?;
                let v = t.consume_u64("int value")?;
                t.expect("COUNT")?;
                let f = t.consume_u64("frequency")?;
                t.expect(";")?;
                ints.push(Int::new(v, f));
            }
            let value = self.resolve_value(t, &name)?;
            sema.sem_int_predict(value, ctx, ints);
            Ok(())
        } else {
            Err(t.err("expected OBJ, VAL or INT after PRED"))
        }
    }

    fn parse_residues(&self, t: &mut Tokens, sema: &mut dyn SemanticAction) -> Result<()> {
        t.expect("RESIDUES")?;
        let name = t.consume("pointer name")?;
        t.expect("AT")?;
        let ctx = self.parse_ctx(t, sema)?;
        t.expect("AS")?;
        t.expect("RESTRICTED")?;
        let samples = t.consume_u64("sample count")?;
        t.expect("SAMPLES")?;
        t.expect("OVER")?;
        let k = t.consume_u64("member count")?;
        t.expect("MEMBERS")?;
        t.expect("{")?;
        let mut bits: u16 = 0;
        for i in 0..k {
            if i > 0 {
                t.expect(",")?;
            }
            let m = t.consume_u64("residue member")?;
            if m >= 16 {
                return Err(t.err(format!("residue member {} out of range", m)));
            }
            bits |= 1u16 << m;
        }
        t.expect("}")?;
        t.expect(";")?;
        let value = self.resolve_value(t, &name)?;
        sema.sem_pointer_residual(value, ctx, bits, samples);
        Ok(())
    }

    /// `AU UNMANAGED ;` | `AU NULL ;` |
    /// `AU <TYPE> <name> FROM CONTEXT <ctx> OFFSET <o> COUNT <f> ;`
    fn parse_au_sample(&self, t: &mut Tokens, sema: &mut dyn SemanticAction) -> Result<Ptr> {
        t.expect("AU")?;
        if t.test("UNMANAGED") {
            t.expect(";")?;
            let au = sema.fold_au(AuKind::Unknown, None);
            return Ok(Ptr::new(au, 0, 0));
        }
        if t.test("NULL") {
            t.expect(";")?;
            let au = sema.fold_au(AuKind::Null, None);
            return Ok(Ptr::new(au, 0, 0));
        }
        let ty = t.consume("AU type")?;
        let name = t.consume("AU name")?;
        t.expect("FROM")?;
        t.expect("CONTEXT")?;
        let ctx = self.parse_ctx(t, sema)?;
        t.expect("OFFSET")?;
        let offset = t.consume_u64("offset")?;
        t.expect("COUNT")?;
        let freq = t.consume_u64("frequency")?;
        t.expect(";")?;

        let kind = match ty.as_str() {
            "GLOBAL" => AuKind::Global(self.resolve_global(t, &name)?),
            "CONSTANT" => AuKind::Constant(self.resolve_global(t, &name)?),
            "STACK" => AuKind::Stack(self.resolve_instr(t, &name)?),
            "HEAP" => AuKind::Heap(self.resolve_instr(t, &name)?),
            other => return Err(t.err(format!("unknown AU type `{}`", other))),
        };
        let au = sema.fold_au(kind, Some(ctx));
        Ok(Ptr::new(au, offset, freq))
    }

    /// `{ STEP WITHIN STEP ... }`, innermost first, ending at TOP.
    fn parse_ctx(&self, t: &mut Tokens, sema: &mut dyn SemanticAction) -> Result<CtxId> {
        t.expect("{")?;
        let mut steps = Vec::new();
        loop {
            if t.test("TOP") {
                steps.push(CtxStep::Top);
            } else if t.test("FUNCTION") {
                let name = t.consume("function name")?;
                steps.push(CtxStep::Fcn { fcn: self.resolve_fcn(t, &name)? });
            } else if t.test("LOOP") {
                let fcn_name = t.consume("loop function")?;
                let header_name = t.consume("loop header")?;
                let depth = t.consume_u64("loop depth")? as u32;
                let fcn = self.resolve_fcn(t, &fcn_name)?;
                let header = self.resolve_block(t, fcn, &header_name)?;
                steps.push(CtxStep::Loop { fcn, header, depth });
            } else {
                return Err(t.err("expected TOP, FUNCTION or LOOP in context"));
            }
            if t.test("}") {
                break;
            }
            t.expect("WITHIN")?;
        }

        // Fold outermost-in so parents exist before children.
        let mut ctx: Option<CtxId> = None;
        for step in steps.into_iter().rev() {
            ctx = Some(sema.fold_ctx(step, ctx));
        }
        ctx.ok_or_else(|| t.err("empty context"))
    }

    // ---- name resolution ----------------------------------------------

    fn resolve_fcn(&self, t: &Tokens, name: &str) -> Result<FcnId> {
        self.ir
            .function_by_name(name)
            .ok_or_else(|| t.err(format!("unknown function `{}`", name)))
    }

    fn resolve_block(&self, t: &Tokens, fcn: FcnId, name: &str) -> Result<BlockId> {
        self.ir
            .function(fcn)
            .blocks
            .iter()
            .copied()
            .find(|&b| self.ir.block(b).name == name)
            .ok_or_else(|| {
                t.err(format!("unknown block `{}` in `{}`", name, self.ir.function(fcn).name))
            })
    }

    fn resolve_instr(&self, t: &Tokens, name: &str) -> Result<InstrId> {
        self.ir
            .instrs
            .iter()
            .find(|i| i.name == name && i.op != Opcode::Deleted)
            .map(|i| i.id)
            .ok_or_else(|| t.err(format!("unknown instruction `{}`", name)))
    }

    fn resolve_global(
        &self,
        t: &Tokens,
        name: &str,
    ) -> Result<crate::shared::models::GlobalId> {
        self.ir
            .globals
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.id)
            .ok_or_else(|| t.err(format!("unknown global `{}`", name)))
    }

    fn resolve_value(&self, t: &Tokens, name: &str) -> Result<ValueRef> {
        self.resolve_instr(t, name).map(ValueRef::Instr)
    }

    /// Resolve an allocation-site name to an AU whose kind reflects the
    /// site: allocas are stack, allocator calls are heap.
    fn resolve_site_au(
        &self,
        t: &Tokens,
        name: &str,
        ctx: CtxId,
        sema: &mut dyn SemanticAction,
    ) -> Result<crate::features::context::AuId> {
        let instr = self.resolve_instr(t, name)?;
        let kind = match &self.ir.instr(instr).op {
            Opcode::Alloca { .. } => AuKind::Stack(instr),
            Opcode::Call { callee, .. } if is_allocator(callee) => AuKind::Heap(instr),
            _ => AuKind::Heap(instr),
        };
        Ok(sema.fold_au(kind, Some(ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::context::FoldManager;
    use crate::features::profile::ports::ProfileInfoBuilder;

    fn fixture_ir() -> ModuleIr {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let hdr = ir.add_block(f, "for.cond");
        ir.add_global("table", 64, false, true);
        ir.append_instr(
            hdr,
            "call.m",
            Opcode::Call { callee: "malloc".into(), args: vec![], noreturn: false },
        );
        ir.append_instr(hdr, "p", Opcode::Gep { base: ValueRef::ConstInt(0), const_offset: None });
        ir.append_instr(hdr, "ld1", Opcode::Load { ptr: ValueRef::ConstInt(0), size: 8 });
        ir
    }

    const PROFILE: &str = "\
BEGIN SPEC PRIV PROFILE
# comment line, ignored
COMPLETE ALLOCATION INFO ;
LOCAL OBJECT call.m at context { LOOP main for.cond 1 WITHIN FUNCTION main WITHIN TOP } ;
PRED OBJ p at { LOOP main for.cond 1 WITHIN FUNCTION main WITHIN TOP } : 2
AU HEAP call.m FROM CONTEXT { FUNCTION main WITHIN TOP } OFFSET 0 COUNT 10 ;
AU GLOBAL table FROM CONTEXT { TOP } OFFSET 8 COUNT 3 ;
PRED VAL ld1 42 ;
PRED INT ld1 at { FUNCTION main WITHIN TOP } : 1
INT 7 COUNT 99 ;
PTR RESIDUES p AT { LOOP main for.cond 1 WITHIN FUNCTION main WITHIN TOP } AS RESTRICTED 4 SAMPLES OVER 2 MEMBERS { 0 , 8 } ;
END SPEC PRIV PROFILE
";

    #[test]
    fn test_parse_full_profile() {
        let ir = fixture_ir();
        let mut fm = FoldManager::new();
        let mut builder = ProfileInfoBuilder::new(&mut fm);
        ProfileParser::new(&ir).parse(PROFILE, &mut builder).unwrap();
        let info = builder.finish();

        assert!(info.valid);
        assert!(info.complete_allocation_info);
        assert_eq!(info.local_aus.len(), 1);
        assert_eq!(info.underlying_objects.len(), 1);
        let ptrs = info.underlying_objects.values().next().unwrap();
        assert_eq!(ptrs.len(), 2);
        assert_eq!(ptrs[0].frequency, 10);
        assert_eq!(ptrs[1].offset, 8);
        assert_eq!(info.value_predictions.len(), 1);
        assert_eq!(info.int_predictions.values().next().unwrap()[0].value, 7);
        let (&(_, _), &(bits, samples)) = info.residues.iter().next().unwrap();
        assert_eq!(bits, 0b1_0000_0001);
        assert_eq!(samples, 4);
    }

    #[test]
    fn test_truncated_profile_is_invalid() {
        let ir = fixture_ir();
        let mut fm = FoldManager::new();
        let mut builder = ProfileInfoBuilder::new(&mut fm);
        let truncated = "BEGIN SPEC PRIV PROFILE\nCOMPLETE ALLOCATION INFO ;\n";
        let res = ProfileParser::new(&ir).parse(truncated, &mut builder);
        assert!(res.is_err());
        assert!(!builder.finish().valid);
    }

    #[test]
    fn test_unknown_name_errors() {
        let ir = fixture_ir();
        let mut fm = FoldManager::new();
        let mut builder = ProfileInfoBuilder::new(&mut fm);
        let bad = "BEGIN SPEC PRIV PROFILE\nPRED VAL nosuch 1 ;\nEND SPEC PRIV PROFILE\n";
        assert!(ProfileParser::new(&ir).parse(bad, &mut builder).is_err());
    }
}
