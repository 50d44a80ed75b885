use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use rxledger_billing::PatientId;
use rxledger_catalog::MedicineId;
use rxledger_core::{ActorId, AggregateId, Money, Percent};
use rxledger_infra::event_store::InMemoryEventStore;
use rxledger_infra::pharmacy::{
    CreateSaleRequest, PharmacyService, ReceiveBatchRequest, RegisterMedicineRequest,
    SaleItemRequest,
};

fn setup() -> (PharmacyService<InMemoryEventStore>, MedicineId, ActorId) {
    let service = PharmacyService::new(InMemoryEventStore::new());
    let actor = ActorId::new();
    let medicine_id = service
        .register_medicine(RegisterMedicineRequest {
            name: "Paracetamol 500".to_string(),
            generic_name: "Paracetamol".to_string(),
            brand_name: None,
            manufacturer: "GSK".to_string(),
            dosage_form: "tablet".to_string(),
            strength: "500mg".to_string(),
            prescription_required: false,
        })
        .unwrap();
    (service, medicine_id, actor)
}

fn receive(service: &PharmacyService<InMemoryEventStore>, medicine_id: MedicineId, lot: u64, quantity: u32) {
    let today = Utc::now().date_naive();
    service
        .receive_batch(
            ReceiveBatchRequest {
                medicine_id,
                batch_number: format!("LOT-{lot}"),
                quantity,
                unit_cost: Money::from_minor(5_000),
                selling_price: Money::from_minor(10_000),
                manufacturing_date: today - Duration::days(300),
                expiry_date: today + Duration::days(365),
                received_date: today,
                location: "main-store".to_string(),
                reference: None,
            },
            ActorId::new(),
        )
        .unwrap();
}

fn bench_receive_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_receipt");
    group.throughput(Throughput::Elements(1));

    group.bench_function("receive_batch", |b| {
        let (service, medicine_id, _) = setup();
        let mut lot = 0u64;
        b.iter(|| {
            lot += 1;
            receive(&service, medicine_id, black_box(lot), 100);
        });
    });

    group.finish();
}

fn bench_consume_with_growing_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("stock_consumption");
    group.throughput(Throughput::Elements(1));

    group.bench_function("consume_fefo", |b| {
        let (service, medicine_id, actor) = setup();
        // One deep lot so every iteration decrements rather than exhausts.
        receive(&service, medicine_id, 1, u32::MAX / 2);
        b.iter(|| {
            service
                .consume_stock(medicine_id, None, black_box(1), None, actor)
                .unwrap();
        });
    });

    group.finish();
}

fn bench_sale_unit_of_work(c: &mut Criterion) {
    let mut group = c.benchmark_group("sale_creation");
    group.sample_size(200);
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_line_sale", |b| {
        let (service, medicine_id, actor) = setup();
        receive(&service, medicine_id, 1, u32::MAX / 2);
        b.iter(|| {
            service
                .create_sale(
                    CreateSaleRequest {
                        patient_id: PatientId(AggregateId::new()),
                        prescription_id: None,
                        items: vec![SaleItemRequest {
                            medicine_id,
                            batch_id: None,
                            quantity: black_box(1),
                            unit_price: Money::from_minor(10_000),
                            discount_pct: Percent::from_percent(10).unwrap(),
                            tax_pct: Percent::from_percent(12).unwrap(),
                        }],
                        notes: None,
                    },
                    actor,
                )
                .unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_receive_throughput,
    bench_consume_with_growing_history,
    bench_sale_unit_of_work
);
criterion_main!(benches);
