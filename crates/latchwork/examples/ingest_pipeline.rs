// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A small ingestion service built from the crate's primitives.
//!
//! The service owns a queue of jobs and a quota gate that limits how many bytes may be in
//! processing at once. Opening the service activates both; closing it waits for in-flight
//! submissions (deferred close), then deactivates the queue and the gate.

use std::thread;

use futures::executor::block_on;
use latchwork::{AsyncOperation, BoundedQueue, QuotaGate, Service, ServiceHooks};

const BYTE_BUDGET: u64 = 64;

#[derive(Debug)]
struct Job {
    name: String,
    bytes: u64,
}

#[derive(Debug, Default)]
struct Ingest {
    jobs: BoundedQueue<Job>,
    budget: QuotaGate,
}

impl ServiceHooks for Ingest {
    fn on_service_open(&self, service: &Service<Self>) {
        self.jobs.activate(None, |_, _| println!("job queue drained"));
        self.budget.activate(BYTE_BUDGET, None, |_, _| println!("byte budget closed"));
        service.complete_open(Ok(()), None);
    }

    fn on_deferred_closing(&self, _service: &Service<Self>) {
        println!("close requested while submissions are in flight");
    }

    fn on_service_close(&self, service: &Service<Self>) {
        self.jobs.deactivate_with_drop(|job| println!("discarding unprocessed job {}", job.name));
        self.budget.deactivate();
        service.complete_close(Ok(()), None);
    }

    fn on_service_reuse(&self, _service: &Service<Self>) {
        self.jobs.reuse();
        self.budget.reuse();
    }
}

fn submit(service: &Service<Ingest>, job: Job) -> bool {
    if !service.try_acquire_service_activity() {
        return false;
    }

    let accepted = service.hooks().jobs.enqueue(job).is_ok();
    service.release_service_activity();
    accepted
}

fn main() {
    let service = Service::new(Ingest::default());
    service.set_deferred_close_behavior();
    block_on(service.open_async(None)).unwrap();

    let worker = thread::spawn({
        let service = service.clone();
        move || {
            let hooks = service.hooks();
            let dequeue = hooks.jobs.create_dequeue_operation();
            let acquire = hooks.budget.create_acquire_context();

            while let Ok(job) = block_on(dequeue.start_dequeue_async(None)) {
                if block_on(acquire.start_acquire_async(job.bytes, None)).is_success() {
                    println!("processing {} ({} bytes)", job.name, job.bytes);
                    hooks.budget.release_quanta(job.bytes);
                }

                dequeue.reuse();
                acquire.reuse();
            }
        }
    });

    for index in 0..8 {
        let job = Job {
            name: format!("job-{index}"),
            bytes: 8 * (index % 4 + 1),
        };
        assert!(submit(&service, job));
    }

    block_on(service.close_async(None)).unwrap();
    assert!(!submit(&service, Job { name: "late".to_owned(), bytes: 1 }));

    worker.join().unwrap();
    service.reuse();
}
