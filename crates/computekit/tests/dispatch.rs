//! Integration tests for recording and submitting dispatches.

use computekit::prelude::*;
use computekit::runtime::headless::RecordedCommand;
use computekit::{AccessorError, BufferField};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn context_with(config: RuntimeConfig) -> (HeadlessDevice, ComputeContext<HeadlessDevice>) {
    init_tracing();
    let device = HeadlessDevice::new();
    let ctx = ComputeContext::new(device.clone(), config).unwrap();
    (device, ctx)
}

fn context() -> (HeadlessDevice, ComputeContext<HeadlessDevice>) {
    context_with(RuntimeConfig::default())
}

struct Globals;

struct Filter {
    params: (f32, [f32; 3]),
    count: u32,
    data: ResourceHandle,
}

fn params_type() -> StructType {
    StructType::new("Params")
        .with_field("gain", ShaderType::FLOAT)
        .with_field("bias", ShaderType::Vector(ScalarKind::Float, 3))
}

fn filter_kernel() -> KernelSource {
    KernelSource::parse(
        "filter",
        "|id| {
            if id.x >= count {
                return;
            }
            data[id.x] = data[id.x] * params.gain + params.bias.x;
        }",
    )
    .unwrap()
    .with_capture(CapturedMember::field::<Filter, _>(
        "params",
        ShaderType::Struct(params_type()),
        |f| {
            HostValue::Struct(vec![
                HostValue::Float(f.params.0),
                HostValue::float_vector(&f.params.1),
            ])
        },
    ))
    .with_capture(CapturedMember::field::<Filter, _>(
        "count",
        ShaderType::UINT,
        |f| f.count.into(),
    ))
    .with_capture(CapturedMember::field::<Filter, _>(
        "data",
        ShaderType::read_write_buffer(ShaderType::FLOAT),
        |f| f.data.into(),
    ))
}

fn constants_of(device: &HeadlessDevice) -> Vec<u8> {
    device
        .executed()
        .last()
        .and_then(|batch| {
            batch.commands.iter().find_map(|command| match command {
                RecordedCommand::SetConstants(bytes) => Some(bytes.clone()),
                _ => None,
            })
        })
        .unwrap_or_default()
}

/// Static captures are read without an instance.
#[test]
fn test_static_captures_dispatch_without_instance() {
    let (device, ctx) = context();
    let source = KernelSource::parse("fill", "|id| { data[id.x] = value; }")
        .unwrap()
        .with_capture(CapturedMember::static_field::<Globals, _>(
            "value",
            ShaderType::FLOAT,
            || HostValue::Float(3.0),
        ))
        .with_capture(CapturedMember::static_property::<Globals, _>(
            "data",
            ShaderType::read_write_buffer(ShaderType::FLOAT),
            || ResourceHandle(5).into(),
        ));
    let kernel = ctx.compile(&source).unwrap();

    ctx.dispatch(&kernel, None, 64).unwrap();
    assert_eq!(&constants_of(&device)[..4], &3.0f32.to_le_bytes());
}

/// Struct captures start on a register and push the next field to a fresh one.
#[test]
fn test_struct_capture_is_packed() {
    let (device, ctx) = context();
    let kernel = ctx.compile(&filter_kernel()).unwrap();

    let layout = kernel.layout();
    assert_eq!(layout.constant_size(), 32);
    match layout.field("count") {
        Some(BufferField::Constant(field)) => assert_eq!(field.offset, 16),
        other => panic!("unexpected field {other:?}"),
    }
    assert!(kernel
        .source()
        .contains("struct Params\n{\n    float gain;\n    float3 bias;\n};\n"));

    let filter = Filter {
        params: (2.0, [1.0, 2.0, 3.0]),
        count: 1000,
        data: ResourceHandle(9),
    };
    ctx.dispatch(&kernel, Some(&filter), 1000).unwrap();

    let bytes = constants_of(&device);
    assert_eq!(bytes.len(), 32);
    assert_eq!(&bytes[0..4], &2.0f32.to_le_bytes());
    assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
    assert_eq!(&bytes[12..16], &3.0f32.to_le_bytes());
    assert_eq!(&bytes[16..20], &1000u32.to_le_bytes());
}

/// Read-only and read-write buffers bind in independent register classes.
#[test]
fn test_buffer_bindings_and_no_constants() {
    let (device, ctx) = context();
    let source = KernelSource::parse("copy", "|id| { output[id.x] = input[id.x] * 2.0; }")
        .unwrap()
        .with_capture(CapturedMember::static_field::<Globals, _>(
            "input",
            ShaderType::read_only_buffer(ShaderType::FLOAT),
            || ResourceHandle(1).into(),
        ))
        .with_capture(CapturedMember::static_field::<Globals, _>(
            "output",
            ShaderType::read_write_buffer(ShaderType::FLOAT),
            || ResourceHandle(2).into(),
        ));
    let kernel = ctx.compile(&source).unwrap();
    assert!(!kernel.layout().has_constants());

    ctx.dispatch(&kernel, None, 128).unwrap();
    let batch = device.executed().pop().unwrap();
    assert_eq!(batch.commands.len(), 4);
    assert_eq!(
        batch.commands[1],
        RecordedCommand::BindResource {
            slot: 0,
            access: AccessMode::ReadOnly,
            handle: ResourceHandle(1),
        }
    );
    assert_eq!(
        batch.commands[2],
        RecordedCommand::BindResource {
            slot: 0,
            access: AccessMode::ReadWrite,
            handle: ResourceHandle(2),
        }
    );
    assert_eq!(batch.dispatches().collect::<Vec<_>>(), vec![(2, 1, 1)]);
}

/// Group counts round up per axis.
#[test]
fn test_two_dimensional_dispatch_rounds_up() {
    let (device, ctx) = context();
    let source = KernelSource::parse("clear", "|id| { image[id.y * 100 + id.x] = 0.0; }")
        .unwrap()
        .with_capture(CapturedMember::static_field::<Globals, _>(
            "image",
            ShaderType::read_write_buffer(ShaderType::FLOAT),
            || ResourceHandle(3).into(),
        ))
        .with_thread_group(ThreadGroupSize::new(8, 8, 1));
    let kernel = ctx.compile(&source).unwrap();
    assert!(kernel.source().contains("[numthreads(8, 8, 1)]"));

    ctx.dispatch(&kernel, None, DispatchSize::new(100, 30, 1))
        .unwrap();
    let batch = device.executed().pop().unwrap();
    assert_eq!(batch.dispatches().collect::<Vec<_>>(), vec![(13, 4, 1)]);
}

/// A wrong instance type is an accessor error and nothing is submitted.
#[test]
fn test_wrong_instance_type() {
    let (device, ctx) = context();
    let kernel = ctx.compile(&filter_kernel()).unwrap();

    let err = ctx.dispatch(&kernel, Some(&5u32), 64).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Accessor(AccessorError::InstanceTypeMismatch { .. })
    ));
    assert!(device.executed().is_empty());
}

/// Shader compiler rejections carry the kernel identity and cache nothing.
#[test]
fn test_shader_compiler_rejection() {
    let (device, ctx) = context();
    device.reject_sources_containing("sqrt");
    let source = KernelSource::parse("root", "|id| { data[id.x] = sqrt(data[id.x]); }")
        .unwrap()
        .with_capture(CapturedMember::static_field::<Globals, _>(
            "data",
            ShaderType::read_write_buffer(ShaderType::FLOAT),
            || ResourceHandle(4).into(),
        ));

    let err = ctx.compile(&source).unwrap_err();
    let definition = ctx.kernel_cache().get_or_compile(&source).unwrap();
    match err {
        RuntimeError::Compile(CompileError::ShaderCompiler { kernel, message }) => {
            assert_eq!(kernel, definition.id.to_string());
            assert!(message.contains("sqrt"));
        }
        other => panic!("expected a shader compiler error, got {other:?}"),
    }
    assert!(ctx.pipeline_cache().is_empty());
}

/// Bytecode written by one context is reused by the next.
#[test]
fn test_bytecode_disk_cache_across_contexts() {
    let temp_dir = TempDir::new().unwrap();
    let config = RuntimeConfigBuilder::new()
        .with_bytecode_cache_dir(temp_dir.path())
        .build();

    let (first_device, first) = context_with(config.clone());
    let kernel = first.compile(&filter_kernel()).unwrap();
    assert!(!kernel.pipeline().from_disk());
    assert_eq!(first_device.compile_count(), 1);
    first.shutdown().unwrap();

    let (second_device, second) = context_with(config);
    let kernel = second.compile(&filter_kernel()).unwrap();
    assert!(kernel.pipeline().from_disk());
    assert_eq!(second_device.compile_count(), 0);
    assert_eq!(second.stats().pipelines.disk_hits, 1);
}

/// A single-slot pool serves back-to-back dispatches by recycling.
#[test]
fn test_minimal_pool_recycles_one_list() {
    let (device, ctx) = context_with(RuntimeConfig::minimal());
    let kernel = ctx.compile(&filter_kernel()).unwrap();
    let filter = Filter {
        params: (1.0, [0.0; 3]),
        count: 64,
        data: ResourceHandle(1),
    };

    let mut last = None;
    for _ in 0..10 {
        let token = ctx.dispatch(&kernel, Some(&filter), 64).unwrap();
        assert!(last.map_or(true, |previous| token > previous));
        last = Some(token);
    }

    let stats = ctx.stats();
    assert_eq!(stats.pool.created, 1);
    assert_eq!(stats.pool.acquires, 10);
    assert_eq!(stats.last_issued, 10);
    assert_eq!(device.executed().len(), 10);
    assert!(device.executed().iter().all(|b| b.allocator == device.executed()[0].allocator));
}
