//! End-to-end scenarios covering both halves of the system on the headless backend.

use std::sync::Arc;
use std::time::Duration;

use computekit::prelude::*;
use computekit::runtime::{CompletionMode, ListState};
use computekit::{BufferField, CompiledCommandList};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Simulation {
    scale: f32,
    counter: u32,
    data: ResourceHandle,
}

impl Simulation {
    fn new() -> Self {
        Self {
            scale: 0.5,
            counter: 1,
            data: ResourceHandle(11),
        }
    }
}

fn scale_member() -> CapturedMember {
    CapturedMember::field::<Simulation, _>("scale", ShaderType::FLOAT, |s| s.scale.into())
}

fn counter_member() -> CapturedMember {
    CapturedMember::field::<Simulation, _>("counter", ShaderType::UINT, |s| s.counter.into())
}

fn data_member() -> CapturedMember {
    CapturedMember::field::<Simulation, _>(
        "data",
        ShaderType::read_write_buffer(ShaderType::FLOAT),
        |s| s.data.into(),
    )
}

fn scale_kernel() -> KernelSource {
    KernelSource::parse("scale", "|id| { data[id.x] = data[id.x] * scale; }")
        .unwrap()
        .with_capture(scale_member())
        .with_capture(data_member())
}

fn context(mode: CompletionMode) -> (HeadlessDevice, ComputeContext<HeadlessDevice>) {
    init_tracing();
    let device = HeadlessDevice::with_completion(mode);
    let config = RuntimeConfigBuilder::new()
        .with_acquire_timeout(Duration::from_millis(200))
        .with_fence_timeout(Duration::from_millis(200))
        .build();
    let ctx = ComputeContext::new(device.clone(), config).unwrap();
    (device, ctx)
}

/// Scalar plus buffer capture: one constant field at offset 0, one resource slot.
#[test]
fn test_scenario_scalar_and_buffer_layout() {
    let (_device, ctx) = context(CompletionMode::Immediate);
    let kernel = ctx.compile(&scale_kernel()).unwrap();
    let layout = kernel.layout();

    assert_eq!(layout.constant_size(), 16);
    match layout.field("scale") {
        Some(BufferField::Constant(field)) => {
            assert_eq!(field.offset, 0);
            assert_eq!(field.hlsl_type, "float");
        }
        other => panic!("scale should be a constant field, got {other:?}"),
    }
    match layout.field("data") {
        Some(BufferField::Resource(field)) => {
            assert_eq!(field.slot, 0);
            assert_eq!(field.access, AccessMode::ReadWrite);
        }
        other => panic!("data should be a resource field, got {other:?}"),
    }

    let source = kernel.source();
    assert_eq!(source.matches("cbuffer ").count(), 1);
    assert_eq!(source.matches("float scale : packoffset(c0.x);").count(), 1);
    assert_eq!(
        source
            .matches("RWStructuredBuffer<float> data : register(u0);")
            .count(),
        1
    );
}

/// Two kernels over the same instance field share one accessor and both see mutations.
#[test]
fn test_scenario_shared_accessor_observes_mutation() {
    let (_device, ctx) = context(CompletionMode::Immediate);

    let increment = KernelSource::parse("increment", "|id| { data[id.x] = data[id.x] + 1.0; }")
        .unwrap()
        .with_capture(counter_member())
        .with_capture(data_member());
    let threshold = KernelSource::parse(
        "threshold",
        "|id| { if id.x < counter { data[id.x] = 0.0; } }",
    )
    .unwrap()
    .with_capture(counter_member())
    .with_capture(data_member());

    let a = ctx.compile(&increment).unwrap();
    let b = ctx.compile(&threshold).unwrap();
    assert_ne!(a.id(), b.id());
    assert!(Arc::ptr_eq(&a.accessors()[0], &b.accessors()[0]));

    let mut sim = Simulation::new();
    assert_eq!(a.read_values(Some(&sim)).unwrap()[0], HostValue::UInt(1));

    sim.counter = 41;
    assert_eq!(a.read_values(Some(&sim)).unwrap()[0], HostValue::UInt(41));
    assert_eq!(b.read_values(Some(&sim)).unwrap()[0], HostValue::UInt(41));
}

/// Resetting a list before its token completes is rejected, not silently allowed.
#[test]
fn test_scenario_reset_before_completion_rejected() {
    let (device, ctx) = context(CompletionMode::Manual);
    let kernel = ctx.compile(&scale_kernel()).unwrap();
    let sim = Simulation::new();

    let mut list: CompiledCommandList<HeadlessDevice> = ctx.acquire().unwrap();
    ctx.record_dispatch(&mut list, &kernel, Some(&sim), DispatchSize::linear(256))
        .unwrap();
    list.close(ctx.device()).unwrap();
    let token = ctx.submit(&mut list).unwrap();
    assert!(!ctx.is_complete(token).unwrap());

    let err = ctx.reset(&mut list).unwrap_err();
    match err {
        RuntimeError::Lifecycle(violation) => assert_eq!(violation.operation, "reset"),
        other => panic!("expected a lifecycle violation, got {other:?}"),
    }
    assert_eq!(list.state(), ListState::Submitted(token));

    device.complete_all();
    ctx.wait(token).unwrap();
    ctx.reset(&mut list).unwrap();
    assert!(list.is_recording());
    ctx.release(list).unwrap();
}

/// An unstructured jump fails emission by name and leaves no pipeline behind.
#[test]
fn test_scenario_unstructured_jump_rejected() {
    let (device, ctx) = context(CompletionMode::Immediate);
    let source = KernelSource::parse(
        "scan",
        "|id| { 'scan: for i in 0..8 { if data[i] > scale { break 'scan; } } }",
    )
    .unwrap()
    .with_capture(scale_member())
    .with_capture(data_member());

    let err = ctx.compile(&source).unwrap_err();
    match &err {
        RuntimeError::Compile(compile) => {
            let construct = compile.construct().unwrap_or_default();
            assert!(construct.starts_with("labeled"), "construct: {construct}");
            assert_eq!(compile.kernel(), Some("scan"));
            assert!(compile.to_string().contains("scan"));
        }
        other => panic!("expected a compile error, got {other:?}"),
    }

    assert!(ctx.pipeline_cache().is_empty());
    assert!(ctx.kernel_cache().is_empty());
    assert_eq!(device.compile_count(), 0);
}

/// After a device-loss signal nothing stale is handed out.
#[test]
fn test_scenario_device_loss_signal() {
    let (_device, ctx) = context(CompletionMode::Immediate);
    let kernel = ctx.compile(&scale_kernel()).unwrap();
    let definition = Arc::clone(kernel.definition());
    let list = ctx.acquire().unwrap();
    ctx.release(list).unwrap();

    ctx.notify_device_lost("simulated removal");

    assert_eq!(
        ctx.acquire().unwrap_err(),
        RuntimeError::DeviceLost("simulated removal".to_string())
    );
    assert!(ctx
        .pipeline_cache()
        .get_or_create(&definition)
        .unwrap_err()
        .is_device_lost());
    assert!(ctx.compile(&scale_kernel()).unwrap_err().is_device_lost());
    assert!(ctx
        .dispatch(&kernel, Some(&Simulation::new()), 64)
        .unwrap_err()
        .is_device_lost());
}

/// Device removal reported by the backend has the same effect as the signal.
#[test]
fn test_scenario_device_removal_from_backend() {
    let (device, ctx) = context(CompletionMode::Immediate);
    let kernel = ctx.compile(&scale_kernel()).unwrap();

    device.remove("page fault");
    assert!(ctx.acquire().unwrap_err().is_device_lost());
    assert!(ctx.is_device_lost());
    assert!(ctx
        .pipeline_cache()
        .get_or_create(kernel.definition())
        .unwrap_err()
        .is_device_lost());
    ctx.shutdown().unwrap();
}
