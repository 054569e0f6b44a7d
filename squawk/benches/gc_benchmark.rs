use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use squawk::demo::DemoProgram;
use squawk::{CollectorKind, Vm, VmSettings};

const RAM: u32 = 64 * 1024;
const EEPROM: u32 = 4 * 1024;

fn bench_settings(collector: CollectorKind) -> VmSettings {
    VmSettings {
        collector,
        ..Default::default()
    }
}

fn run_case(c: &mut Criterion, name: &str, program: DemoProgram) {
    for collector in [CollectorKind::Cheney, CollectorKind::Lisp2] {
        let settings = bench_settings(collector);
        c.bench_function(&format!("{name}_{collector:?}").to_lowercase(), |b| {
            b.iter_batched(
                || program.build(EEPROM, RAM, &settings),
                |om| {
                    let mut vm = Vm::boot(om, settings.clone()).expect("boot");
                    vm.interpreter_mut().capture_output();
                    let code = vm.run().expect("run");
                    black_box((code, vm.heap().collection_count()));
                },
                BatchSize::SmallInput,
            )
        });
    }
}

fn gc_benchmark(c: &mut Criterion) {
    run_case(c, "short_lived_arrays", DemoProgram::default());
    run_case(
        c,
        "large_survivor_ring",
        DemoProgram {
            ring: 64,
            array_length: 16,
            ..Default::default()
        },
    );
}

criterion_group!(benches, gc_benchmark);
criterion_main!(benches);
