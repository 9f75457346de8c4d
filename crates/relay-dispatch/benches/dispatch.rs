use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use relay_dispatch::{
    EntityId, MessageBus, MessageFn, MessageHandler, TargetedMessage, UntargetedMessage,
};

#[derive(Clone)]
struct Tick {
    frame: u64,
}

impl UntargetedMessage for Tick {}

#[derive(Clone)]
struct Damage {
    amount: i32,
}

impl TargetedMessage for Damage {}

fn bench_untargeted_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("untargeted_emit");

    for handler_count in [1u64, 8, 64, 256] {
        group.throughput(Throughput::Elements(handler_count));
        group.bench_with_input(
            BenchmarkId::new("handlers", handler_count),
            &handler_count,
            |b, &count| {
                let bus = MessageBus::new();
                let facades: Vec<Arc<MessageHandler>> = (0..count)
                    .map(|i| {
                        let facade = MessageHandler::new(EntityId::new(i));
                        facade.set_active(true);
                        let callback: Arc<MessageFn<Tick>> = Arc::new(|tick: &mut Tick| {
                            tick.frame = tick.frame.wrapping_add(1);
                        });
                        facade.register_untargeted::<Tick>(callback, 0, &bus);
                        facade
                    })
                    .collect();
                black_box(&facades);

                b.iter(|| {
                    let mut tick = Tick { frame: 0 };
                    bus.emit_untargeted(black_box(&mut tick));
                    black_box(tick.frame)
                });
            },
        );
    }

    group.finish();
}

fn bench_targeted_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("targeted_emit");

    // Many contexts registered, one context hit per emission.
    for context_count in [1u64, 64, 1024] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("contexts", context_count),
            &context_count,
            |b, &count| {
                let bus = MessageBus::new();
                let facade = MessageHandler::new(EntityId::new(0));
                facade.set_active(true);
                for i in 0..count {
                    let callback: Arc<MessageFn<Damage>> = Arc::new(|damage: &mut Damage| {
                        damage.amount = damage.amount.wrapping_add(1);
                    });
                    facade.register_targeted::<Damage>(EntityId::new(i), callback, 0, &bus);
                }
                let target = EntityId::new(count / 2);

                b.iter(|| {
                    let mut damage = Damage { amount: 0 };
                    bus.emit_targeted(black_box(target), black_box(&mut damage));
                    black_box(damage.amount)
                });
            },
        );
    }

    group.finish();
}

fn bench_register_revoke(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_revoke");
    group.throughput(Throughput::Elements(1));

    group.bench_function("untargeted_roundtrip", |b| {
        let bus = MessageBus::new();
        let facade = MessageHandler::new(EntityId::new(0));
        facade.set_active(true);

        b.iter(|| {
            let callback: Arc<MessageFn<Tick>> = Arc::new(|_| {});
            let mut registration = facade.register_untargeted::<Tick>(callback, 0, &bus);
            registration.revoke();
            black_box(registration.is_revoked())
        });
    });

    group.finish();
}

fn bench_priority_spread(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_spread");

    // Same handler count, spread over one bucket vs one bucket each.
    for buckets in [1i32, 16] {
        let handler_count = 16u64;
        group.throughput(Throughput::Elements(handler_count));
        group.bench_with_input(
            BenchmarkId::new("buckets", buckets),
            &buckets,
            |b, &buckets| {
                let bus = MessageBus::new();
                let facade = MessageHandler::new(EntityId::new(0));
                facade.set_active(true);
                for i in 0..handler_count {
                    let callback: Arc<MessageFn<Tick>> = Arc::new(|tick: &mut Tick| {
                        tick.frame = tick.frame.wrapping_add(1);
                    });
                    let priority = (i as i32) % buckets;
                    facade.register_untargeted::<Tick>(callback, priority, &bus);
                }

                b.iter(|| {
                    let mut tick = Tick { frame: 0 };
                    bus.emit_untargeted(black_box(&mut tick));
                    black_box(tick.frame)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_untargeted_emit,
    bench_targeted_emit,
    bench_register_revoke,
    bench_priority_spread
);
criterion_main!(benches);
