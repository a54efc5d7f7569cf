//! Instrumentation session.
//!
//! One session covers one loaded binary, from the moment it becomes
//! available until just before it goes away:
//! 1. Discover functions from the host's symbols
//! 2. Analyse, build, instrument and emit every function
//! 3. Deploy all copies into one detour buffer and redirect the originals
//! 4. Release the buffer at teardown

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::analysis::split_into_blocks;
use crate::arch::Arch;
use crate::catalog::{discover, Function, ModuleId, ModuleInfo, Placement, SymbolSource};
use crate::codegen::{generate, CodegenContext};
use crate::detour::{self, Deployment, PreparedFunction};
use crate::emit::emit;
use crate::error::{Error, Result};
use crate::ir_builder::build_ir;
use crate::memory::{read_vec, ExecAllocator, TargetMemory};
use crate::regalloc::choose_base_register;
use crate::runtime::{BlockInfo, HookAddresses};
use crate::sink::{emit_logged, format_block_infos, format_blocks, format_ir, DebugSink};

/// Progress stage during instrumentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Discovering,
    Instrumenting,
    Deploying,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovering => "Discovering functions",
            Self::Instrumenting => "Instrumenting functions",
            Self::Deploying => "Deploying detours",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during instrumentation.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    pub stage: ProgressStage,
    /// Function being processed.
    pub current_item: Option<String>,
    pub current: usize,
    pub total: usize,
    /// Functions prepared so far.
    pub instrumented: usize,
    /// Functions left untouched so far.
    pub skipped: usize,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self {
            stage: ProgressStage::Discovering,
            current_item: None,
            current: 0,
            total: 0,
            instrumented: 0,
            skipped: 0,
        }
    }
}

/// Progress callback type.
pub type ProgressCallback = Arc<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration of an instrumentation session.
#[derive(Clone)]
pub struct InstrumentConfig {
    pub arch: Arch,
    pub hooks: HookAddresses,
    /// Alignment of every copy inside the detour buffer.
    pub function_alignment: usize,
    /// Also record accesses through the stack pointer.
    pub record_stack_accesses: bool,
    /// Names of functions to leave alone.
    pub skip_functions: Vec<String>,
    /// Generate everything but write nothing to the target.
    pub dry_run: bool,
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for InstrumentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentConfig")
            .field("arch", &self.arch)
            .field("hooks", &self.hooks)
            .field("function_alignment", &self.function_alignment)
            .field("record_stack_accesses", &self.record_stack_accesses)
            .field("skip_functions", &self.skip_functions)
            .field("dry_run", &self.dry_run)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            arch: Arch::X86_64,
            hooks: HookAddresses::default(),
            function_alignment: 16,
            record_stack_accesses: false,
            skip_functions: Vec::new(),
            dry_run: false,
            progress_callback: None,
        }
    }
}

impl InstrumentConfig {
    pub fn validate(&self) -> Result<()> {
        self.hooks.validate()?;
        let align = self.function_alignment;
        if !align.is_power_of_two() || align < self.arch.word_size() {
            return Err(Error::InvalidConfig(format!(
                "function alignment {align} must be a power of two of at least {}",
                self.arch.word_size()
            )));
        }
        Ok(())
    }
}

/// Summary of one `instrument_all` pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstrumentStats {
    pub functions: usize,
    pub instrumented: usize,
    pub skipped: usize,
    pub blocks: usize,
    pub jump_tables: usize,
    /// Size of the detour buffer; 0 in a dry run.
    pub buffer_size: usize,
    pub relocations: usize,
}

/// A function left uninstrumented and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedFunction {
    pub name: String,
    pub addr: u64,
    pub reason: String,
}

/// All state for one instrumented binary.
pub struct InstrumentationSession {
    config: InstrumentConfig,
    module: ModuleInfo,
    functions: Vec<Function>,
    block_infos: Vec<BlockInfo>,
    skipped: Vec<SkippedFunction>,
    next_key: u64,
    deployment: Option<Deployment>,
    sink: Option<Box<dyn DebugSink>>,
}

impl std::fmt::Debug for InstrumentationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentationSession")
            .field("module", &self.module.name)
            .field("functions", &self.functions.len())
            .field("block_infos", &self.block_infos.len())
            .field("deployed", &self.deployment.is_some())
            .finish()
    }
}

impl InstrumentationSession {
    /// Validate `config` and discover the functions of `module`.
    pub fn init(module: ModuleInfo, symbols: &dyn SymbolSource, config: InstrumentConfig) -> Result<Self> {
        config.validate()?;
        let mut session = Self {
            config,
            module,
            functions: Vec::new(),
            block_infos: Vec::new(),
            skipped: Vec::new(),
            next_key: 1,
            deployment: None,
            sink: None,
        };
        session.report(&ProgressInfo::default());
        session.functions = discover(&session.module, symbols)?;
        info!(
            module = %session.module.name,
            functions = session.functions.len(),
            "session initialised"
        );
        Ok(session)
    }

    /// Send block and IR listings of every prepared function to `sink`.
    pub fn set_sink(&mut self, sink: Box<dyn DebugSink>) {
        self.sink = Some(sink);
    }

    pub fn module(&self) -> &ModuleInfo {
        &self.module
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn skipped(&self) -> &[SkippedFunction] {
        &self.skipped
    }

    /// Descriptions of every instrumented block, ordered by key.
    pub fn block_infos(&self) -> &[BlockInfo] {
        &self.block_infos
    }

    /// Description the runtime receives for `key`.
    pub fn block_info(&self, key: u64) -> Option<&BlockInfo> {
        self.block_infos
            .binary_search_by_key(&key, |info| info.key)
            .ok()
            .map(|idx| &self.block_infos[idx])
    }

    pub fn deployment(&self) -> Option<&Deployment> {
        self.deployment.as_ref()
    }

    fn report(&self, progress: &ProgressInfo) {
        if let Some(ref cb) = self.config.progress_callback {
            cb(progress);
        }
    }

    /// Instrument every discovered function and redirect the originals.
    ///
    /// Functions failing with a function-local error are skipped. Any other
    /// error leaves the target exactly as it was.
    pub fn instrument_all(
        &mut self,
        mem: &mut dyn TargetMemory,
        alloc: &mut dyn ExecAllocator,
    ) -> Result<InstrumentStats> {
        if self.deployment.is_some() {
            return Err(Error::Fatal(format!("module {} is already instrumented", self.module.name)));
        }

        let mut progress = ProgressInfo {
            stage: ProgressStage::Instrumenting,
            total: self.functions.len(),
            ..Default::default()
        };
        self.report(&progress);

        let mut stats = InstrumentStats {
            functions: self.functions.len(),
            ..Default::default()
        };
        let mut prepared = Vec::new();
        let mut infos = Vec::new();
        let mut skipped = Vec::new();
        let mut next_key = self.next_key;

        for index in 0..self.functions.len() {
            let name = self.functions[index].name.clone();
            progress.current = index;
            progress.current_item = Some(name.clone());
            self.report(&progress);

            if self.config.skip_functions.contains(&name) {
                debug!(function = %name, "skipped by configuration");
                skipped.push(self.skip_record(index, "skipped by configuration".into()));
                progress.skipped += 1;
                continue;
            }

            match self.prepare(index, &*mem, next_key) {
                Ok((func, block_infos)) => {
                    next_key += block_infos.len() as u64;
                    infos.extend(block_infos);
                    prepared.push(func);
                    progress.instrumented += 1;
                }
                Err(err) if err.is_function_local() => {
                    warn!(function = %name, error = %err, "function left uninstrumented");
                    skipped.push(self.skip_record(index, err.to_string()));
                    progress.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        stats.instrumented = prepared.len();
        stats.skipped = skipped.len();
        stats.blocks = self.functions.iter().map(|f| f.blocks.len()).sum();
        stats.jump_tables = self.functions.iter().map(|f| f.jump_tables.len()).sum();

        if !self.config.dry_run {
            progress.stage = ProgressStage::Deploying;
            progress.current_item = None;
            self.report(&progress);

            let plan = detour::plan(&prepared, self.config.function_alignment)?;
            let deployment = detour::deploy(&prepared, &plan, self.config.arch, mem, alloc)?;
            for deployed in &deployment.functions {
                let func = &mut self.functions[deployed.index];
                func.instrumented = Some(Placement {
                    addr: deployed.instrumented.addr,
                    size: deployed.instrumented.size,
                });
                func.fallback_addr = Some(deployed.fallback_addr);
            }
            stats.buffer_size = plan.total;
            stats.relocations = deployment.stats.total();
            self.deployment = Some(deployment);
        }

        self.block_infos = infos;
        self.skipped = skipped;
        self.next_key = next_key;

        progress.stage = ProgressStage::Complete;
        progress.current = progress.total;
        self.report(&progress);

        info!(
            module = %self.module.name,
            instrumented = stats.instrumented,
            skipped = stats.skipped,
            blocks = self.block_infos.len(),
            dry_run = self.config.dry_run,
            "instrumentation finished"
        );
        Ok(stats)
    }

    fn skip_record(&self, index: usize, reason: String) -> SkippedFunction {
        let func = &self.functions[index];
        SkippedFunction {
            name: func.name.clone(),
            addr: func.addr,
            reason,
        }
    }

    /// Produce both copies of function `index`.
    fn prepare(
        &mut self,
        index: usize,
        mem: &dyn TargetMemory,
        first_key: u64,
    ) -> Result<(PreparedFunction, Vec<BlockInfo>)> {
        let arch = self.config.arch;
        let record_stack = self.config.record_stack_accesses;

        let func = &self.functions[index];
        let code = read_vec(mem, func.addr, func.size)?;
        let analysis = split_into_blocks(func, &code, &self.module, mem, arch)?;

        let func = &mut self.functions[index];
        func.blocks = analysis.blocks;
        func.jump_tables = analysis.jump_tables;
        let func = &self.functions[index];

        let mut ir = build_ir(func, &code[..analysis.code_size], arch, record_stack)?;
        let fallback = emit(&ir)?;

        let base = choose_base_register(&ir)?;
        let ctx = CodegenContext {
            hooks: &self.config.hooks,
            base,
            record_stack,
            first_key,
        };
        let infos = generate(&mut ir, &ctx)?;
        let instrumented = emit(&ir)?;

        if let Some(sink) = self.sink.as_deref_mut() {
            emit_logged(sink, &format_blocks(func));
            emit_logged(sink, &format_ir(&ir));
            emit_logged(sink, &format_block_infos(&infos));
        }

        debug!(
            function = %func.name,
            base = base.name(arch),
            size = instrumented.len(),
            fallback = fallback.len(),
            "prepared"
        );
        Ok((
            PreparedFunction {
                index,
                name: func.name.clone(),
                addr: func.addr,
                size: func.size,
                instrumented,
                fallback,
            },
            infos,
        ))
    }

    /// Release the detour buffer. Must run before the module is unloaded.
    pub fn teardown(mut self, alloc: &mut dyn ExecAllocator) {
        if let Some(mut deployment) = self.deployment.take() {
            deployment.teardown(alloc);
        }
        info!(module = %self.module.name, "session torn down");
    }
}

/// Owner of the current session, driven by module lifecycle events.
///
/// The caller serialises the two events; only the module named at
/// construction is instrumented.
#[derive(Debug)]
pub struct Instrumentor {
    target: String,
    config: InstrumentConfig,
    session: Option<InstrumentationSession>,
}

impl Instrumentor {
    pub fn new(target: impl Into<String>, config: InstrumentConfig) -> Self {
        Self {
            target: target.into(),
            config,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&InstrumentationSession> {
        self.session.as_ref()
    }

    /// React to `module` being loaded. Returns `None` if it is not the
    /// target or the target is already being instrumented.
    pub fn on_target_available(
        &mut self,
        module: ModuleInfo,
        symbols: &dyn SymbolSource,
        mem: &mut dyn TargetMemory,
        alloc: &mut dyn ExecAllocator,
    ) -> Result<Option<InstrumentStats>> {
        if module.name != self.target {
            return Ok(None);
        }
        if self.session.is_some() {
            warn!(module = %module.name, "target loaded twice, ignoring");
            return Ok(None);
        }

        let mut session = InstrumentationSession::init(module, symbols, self.config.clone())?;
        match session.instrument_all(mem, alloc) {
            Ok(stats) => {
                self.session = Some(session);
                Ok(Some(stats))
            }
            Err(err) => {
                session.teardown(alloc);
                Err(err)
            }
        }
    }

    /// React to module `id` being unloaded. Returns whether a session ended.
    pub fn on_target_about_to_unload(&mut self, id: ModuleId, alloc: &mut dyn ExecAllocator) -> bool {
        match self.session.take() {
            Some(session) if session.module().id == id => {
                session.teardown(alloc);
                true
            }
            other => {
                self.session = other;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Section, Symbol};
    use crate::memory::{BumpAllocator, ImageMemory};
    use std::sync::Mutex;

    const TEXT: u64 = 0xFFFF_FFFF_A000_0000;
    const ARENA: u64 = 0xFFFF_FFFF_A100_0000;

    fn hooks() -> HookAddresses {
        HookAddresses {
            on_function_entry: TEXT + 0x800,
            on_function_exit: TEXT + 0x810,
            on_block_end: TEXT + 0x820,
            on_call_pre: TEXT + 0x830,
            on_call_post: TEXT + 0x840,
            on_indirect_call: TEXT + 0x850,
            on_indirect_jump: TEXT + 0x860,
        }
    }

    fn config() -> InstrumentConfig {
        InstrumentConfig {
            hooks: hooks(),
            ..Default::default()
        }
    }

    /// Two functions: `store` writes memory, `pad` is nothing but padding.
    fn target() -> (ModuleInfo, Vec<Symbol>, ImageMemory) {
        let mut text = vec![0u8; 0x100];
        // mov [rdi], esi; ret
        text[..3].copy_from_slice(&[0x89, 0x37, 0xC3]);
        let module = ModuleInfo {
            id: ModuleId(7),
            name: "demo".into(),
            sections: vec![Section { name: ".text".into(), addr: TEXT, size: 0x100 }],
            code_areas: vec![TEXT..TEXT + 0x100],
        };
        let symbols = vec![
            Symbol { name: "store".into(), module: ModuleId(7), addr: TEXT },
            Symbol { name: "pad".into(), module: ModuleId(7), addr: TEXT + 0x40 },
        ];
        let mut mem = ImageMemory::new();
        mem.map(TEXT, text, true).unwrap();
        mem.map_zeroed(ARENA, 0x10000, true).unwrap();
        (module, symbols, mem)
    }

    #[test]
    fn test_config_validation() {
        assert!(InstrumentConfig::default().validate().is_err());
        assert!(config().validate().is_ok());
        let bad = InstrumentConfig {
            function_alignment: 4,
            ..config()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidConfig(_))));
        let debug = format!("{:?}", config());
        assert!(debug.contains("progress_callback: false"));
    }

    #[test]
    fn test_instrument_all_skips_padding_function() {
        let (module, symbols, mut mem) = target();
        let mut alloc = BumpAllocator::new(ARENA, 0x10000);
        let mut session = InstrumentationSession::init(module, &symbols, config()).unwrap();
        let stats = session.instrument_all(&mut mem, &mut alloc).unwrap();

        assert_eq!(stats.functions, 2);
        assert_eq!(stats.instrumented, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(session.skipped()[0].name, "pad");

        let store = &session.functions()[0];
        let placement = store.instrumented.unwrap();
        assert_eq!(placement.addr, ARENA);
        assert!(store.fallback_addr.unwrap() > placement.addr);
        assert_eq!(mem.bytes(TEXT, 1).unwrap(), vec![0xE9]);
        assert_eq!(mem.bytes(TEXT + 0x40, 0x40).unwrap(), vec![0; 0x40]);

        let info = session.block_info(1).unwrap();
        assert_eq!(info.accesses.len(), 1);
        assert_eq!(info.function, TEXT);

        session.teardown(&mut alloc);
        assert!(alloc.live().is_empty());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let (module, symbols, mut mem) = target();
        let mut alloc = BumpAllocator::new(ARENA, 0x10000);
        let cfg = InstrumentConfig {
            dry_run: true,
            skip_functions: vec!["pad".into()],
            ..config()
        };
        let mut session = InstrumentationSession::init(module, &symbols, cfg).unwrap();
        let stats = session.instrument_all(&mut mem, &mut alloc).unwrap();

        assert_eq!(stats.instrumented, 1);
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(session.skipped()[0].reason, "skipped by configuration");
        assert_eq!(mem.write_count(), 0);
        assert!(alloc.live().is_empty());
        assert!(session.functions()[0].instrumented.is_none());
        assert!(!session.block_infos().is_empty());
    }

    #[test]
    fn test_progress_and_sink() {
        let (module, symbols, mut mem) = target();
        let mut alloc = BumpAllocator::new(ARENA, 0x10000);
        let stages = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&stages);
        let cfg = InstrumentConfig {
            progress_callback: Some(Arc::new(move |p: &ProgressInfo| {
                seen.lock().unwrap().push(p.stage);
            })),
            ..config()
        };
        let mut session = InstrumentationSession::init(module, &symbols, cfg).unwrap();
        session.set_sink(Box::new(crate::sink::MemorySink::default()));
        session.instrument_all(&mut mem, &mut alloc).unwrap();

        let stages = stages.lock().unwrap();
        assert_eq!(stages.first(), Some(&ProgressStage::Discovering));
        assert!(stages.contains(&ProgressStage::Deploying));
        assert_eq!(stages.last(), Some(&ProgressStage::Complete));
    }

    #[test]
    fn test_second_pass_is_rejected() {
        let (module, symbols, mut mem) = target();
        let mut alloc = BumpAllocator::new(ARENA, 0x10000);
        let mut session = InstrumentationSession::init(module, &symbols, config()).unwrap();
        session.instrument_all(&mut mem, &mut alloc).unwrap();
        assert!(matches!(
            session.instrument_all(&mut mem, &mut alloc),
            Err(Error::Fatal(_))
        ));
    }

    #[test]
    fn test_instrumentor_lifecycle() {
        let (module, symbols, mut mem) = target();
        let mut alloc = BumpAllocator::new(ARENA, 0x10000);
        let mut instrumentor = Instrumentor::new("demo", config());

        let mut other = module.clone();
        other.name = "other".into();
        assert!(instrumentor
            .on_target_available(other, &symbols, &mut mem, &mut alloc)
            .unwrap()
            .is_none());

        let stats = instrumentor
            .on_target_available(module, &symbols, &mut mem, &mut alloc)
            .unwrap()
            .unwrap();
        assert_eq!(stats.instrumented, 1);
        assert!(instrumentor.session().is_some());

        assert!(!instrumentor.on_target_about_to_unload(ModuleId(8), &mut alloc));
        assert!(instrumentor.on_target_about_to_unload(ModuleId(7), &mut alloc));
        assert!(instrumentor.session().is_none());
        assert_eq!(alloc.free_count(), 1);
    }

    #[test]
    fn test_allocation_failure_aborts_binary() {
        let (module, symbols, mut mem) = target();
        let mut alloc = BumpAllocator::new(ARENA, 4);
        let mut session = InstrumentationSession::init(module, &symbols, config()).unwrap();
        let err = session.instrument_all(&mut mem, &mut alloc).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert_eq!(mem.write_count(), 0);
        assert!(session.deployment().is_none());
    }
}
