//! The VM driver.
//!
//! [`Vm`] owns the heap and the interpreter and runs the outer loop: the
//! interpreter runs until it needs a collection, the driver collects,
//! optionally writes a checkpoint, and resumes the suspended context with
//! the outcome.

use std::path::Path;

use crate::class::cno;
use crate::collector::Heap;
use crate::config::VmSettings;
use crate::error::{ImageError, VmError, VmResult};
use crate::fatal;
use crate::heap::ObjectMemory;
use crate::image;
use crate::interpreter::{Interpreter, SupportCall, Suspension};
use crate::layout::*;

pub struct Vm {
    heap: Heap,
    interpreter: Interpreter,
    settings: VmSettings,
    checkpoints: u32,
}

impl Vm {
    /// Attach collectors to an image. An image whose RAM has no object
    /// memory yet has never run and gets its partitions initialised.
    pub fn boot(om: ObjectMemory, settings: VmSettings) -> VmResult<Self> {
        settings.validate().map_err(VmError::Config)?;
        if om.root(Segment::Rom, root::VM_EXTENSION) == 0 {
            return Err(ImageError::Layout("ROM has no VMExtension class").into());
        }
        if om.root(Segment::Rom, root::SUITE_TABLE) == 0 {
            return Err(ImageError::Layout("ROM has no suite table").into());
        }
        let fresh = om.memory_start() == 0;
        let heap = Heap::new(om, &settings, fresh)?;
        log::info!(
            target: "squawk",
            "booted {} image with the {:?} collector",
            if fresh { "fresh" } else { "checkpointed" },
            heap.collector_kind()
        );
        Ok(Self {
            heap,
            interpreter: Interpreter::new(&settings),
            settings,
            checkpoints: 0,
        })
    }

    pub fn load(path: &Path, settings: VmSettings) -> VmResult<Self> {
        let om = image::load_image(path, &settings)?;
        Self::boot(om, settings)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }

    pub fn checkpoints(&self) -> u32 {
        self.checkpoints
    }

    /// Run the image until the guest exits and return its exit code.
    ///
    /// A checkpointed image resumes the context it was saved in; a fresh
    /// one starts in `VMExtension.vmstart`.
    pub fn run(&mut self) -> VmResult<i32> {
        if self.heap.om.class_state_table() == 0 {
            let table = self.allocate("class state table", |heap, _| {
                let klass = heap.om.class_from_cno(cno::OBJECT_ARRAY);
                Ok(heap.om.new_array(klass, CLS_STATE_TABLE_SIZE))
            })?;
            self.heap.om.set_ram_root(root::CLASS_STATE_TABLE, table);
        }

        let mut chunk = self.heap.om.root(Segment::Ram, root::CURRENT_STACK_CHUNK);
        if chunk == 0 {
            chunk = self.allocate("initial context", |heap, interpreter| {
                interpreter.create_execution_context(heap, SupportCall::Vmstart, 0)
            })?;
        }

        let mut gc_worked = true;
        loop {
            match self.interpreter.interpret(&mut self.heap, chunk, gc_worked)? {
                Suspension::Exit(code) => {
                    log::info!(target: "squawk", "guest exited with code {code}");
                    if self.settings.stats {
                        self.log_stats();
                    }
                    return Ok(code);
                }
                Suspension::Collect { chunk: suspended } => {
                    self.heap.om.set_ram_root(root::CURRENT_STACK_CHUNK, suspended);
                    gc_worked = self.heap.collect_garbage()?;
                    // The context may have moved.
                    chunk = self.heap.om.root(Segment::Ram, root::CURRENT_STACK_CHUNK);
                    self.checkpoint()?;
                }
            }
        }
    }

    /// Allocate outside the interpreter, collecting once if the first
    /// attempt fails.
    fn allocate<F>(&mut self, what: &str, mut attempt: F) -> VmResult<u32>
    where
        F: FnMut(&mut Heap, &mut Interpreter) -> VmResult<u32>,
    {
        let oop = attempt(&mut self.heap, &mut self.interpreter)?;
        if oop != 0 {
            return Ok(oop);
        }
        if self.heap.collect_garbage()? {
            let oop = attempt(&mut self.heap, &mut self.interpreter)?;
            if oop != 0 {
                return Ok(oop);
            }
        }
        Err(fatal!("no room in RAM for the {what}"))
    }

    fn checkpoint(&mut self) -> VmResult<()> {
        let Some(base) = &self.settings.checkpoint else {
            return Ok(());
        };
        let path = image::checkpoint_path(base, self.checkpoints);
        image::save_image(&self.heap.om, &path)?;
        self.checkpoints += 1;
        Ok(())
    }

    fn log_stats(&self) {
        self.heap.log_stats();
        log::info!(
            target: "squawk",
            "{} instructions, {} collections, {} migrations, {} of {} RAM bytes free",
            self.interpreter.instruction_count(),
            self.heap.collection_count(),
            self.heap.migrations(),
            self.heap.free_memory(true),
            self.heap.total_memory(true)
        );
    }
}
