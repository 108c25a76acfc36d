use super::*;
use crate::arguments::{ArgumentType, Cardinality};

fn max_cpu() -> Argument {
    Argument::scalar("max_num_cpu", ArgumentType::Integer).key("max-cpu")
}

#[test]
pub fn inherited_argument_resolves_to_base_descriptor() {
    let mut builder = RegistryBuilder::new();
    builder
        .declare_type(TypeDeclaration::new("Base").member("max_num_cpu"))
        .declare_type(TypeDeclaration::new("Derived").base("Base").member("width"))
        .register(Identity::new("Base", "max_num_cpu"), max_cpu());

    let registry = builder.build().unwrap();

    assert_eq!(registry.resolve("Derived", "max_num_cpu"), Some(&max_cpu()));
    assert_eq!(registry.declared("Derived", "max_num_cpu"), None);
}

#[test]
pub fn own_registration_shadows_ancestor() {
    let mut builder = RegistryBuilder::new();
    builder
        .declare_type(TypeDeclaration::new("Base"))
        .declare_type(TypeDeclaration::new("Derived").base("Base"))
        .register(Identity::new("Base", "max_num_cpu"), max_cpu())
        .register(
            Identity::new("Derived", "max_num_cpu"),
            max_cpu().key("cpus"),
        );

    let registry = builder.build().unwrap();

    assert_eq!(registry.resolve("Derived", "max_num_cpu").unwrap().key, "cpus");
    assert_eq!(registry.resolve("Base", "max_num_cpu").unwrap().key, "max-cpu");
}

#[test]
pub fn duplicate_registration_overwrites() {
    let mut builder = RegistryBuilder::new();
    builder
        .register(Identity::new("Job", "paths"), Argument::list("paths", ArgumentType::Path))
        .register(
            Identity::new("Job", "paths"),
            Argument::list("paths", ArgumentType::String).required(),
        );

    let registry = builder.build().unwrap();
    let argument = registry.resolve("Job", "paths").unwrap();

    assert_eq!(argument.kind, ArgumentType::String);
    assert_eq!(argument.cardinality, Cardinality::ListRequired);
}

#[test]
pub fn unknown_member_is_not_found() {
    let mut builder = RegistryBuilder::new();
    builder
        .declare_type(TypeDeclaration::new("Base"))
        .declare_type(TypeDeclaration::new("Derived").base("Base"));

    let registry = builder.build().unwrap();

    assert_eq!(registry.resolve("Derived", "width"), None);
    assert_eq!(registry.resolve("Unknown", "width"), None);
}

#[test]
pub fn diamond_resolution_is_deterministic() {
    // Left and Right both derive from Root, only Right redeclares the member
    let mut builder = RegistryBuilder::new();
    builder
        .declare_type(TypeDeclaration::new("Root"))
        .declare_type(TypeDeclaration::new("Left").base("Root"))
        .declare_type(TypeDeclaration::new("Right").base("Root"))
        .declare_type(TypeDeclaration::new("Leaf").base("Left").base("Right"))
        .register(Identity::new("Root", "max_num_cpu"), max_cpu())
        .register(Identity::new("Right", "max_num_cpu"), max_cpu().key("right"));

    let registry = builder.build().unwrap();

    assert_eq!(
        registry.resolution_order("Leaf"),
        ["Leaf", "Left", "Right", "Root"]
    );
    // Left is asked first and answers through its own ancestor
    for _ in 0..8 {
        assert_eq!(registry.resolve("Leaf", "max_num_cpu").unwrap().key, "max-cpu");
    }
}

#[test]
pub fn members_include_ancestors_once() {
    let mut builder = RegistryBuilder::new();
    builder
        .declare_type(
            TypeDeclaration::new("Base")
                .member("max_num_cpu")
                .member("_scratch"),
        )
        .declare_type(
            TypeDeclaration::new("Derived")
                .base("Base")
                .member("width")
                .member("max_num_cpu"),
        );

    let registry = builder.build().unwrap();

    assert_eq!(registry.members("Derived"), vec!["width", "max_num_cpu"]);
}

#[test]
pub fn unknown_base_is_rejected() {
    let mut builder = RegistryBuilder::new();
    builder.declare_type(TypeDeclaration::new("Derived").base("Missing"));

    assert_eq!(
        builder.build().unwrap_err(),
        RegistryError::UnknownBase {
            owner: "Derived".to_owned(),
            base: "Missing".to_owned()
        }
    );
}

#[test]
pub fn cyclic_hierarchy_is_rejected() {
    let mut builder = RegistryBuilder::new();
    builder
        .declare_type(TypeDeclaration::new("A").base("B"))
        .declare_type(TypeDeclaration::new("B").base("A"));

    assert!(matches!(
        builder.build(),
        Err(RegistryError::CyclicHierarchy(_))
    ));
}

#[test]
pub fn inconsistent_order_is_rejected() {
    let mut builder = RegistryBuilder::new();
    builder
        .declare_type(TypeDeclaration::new("X"))
        .declare_type(TypeDeclaration::new("Y"))
        .declare_type(TypeDeclaration::new("A").base("X").base("Y"))
        .declare_type(TypeDeclaration::new("B").base("Y").base("X"))
        .declare_type(TypeDeclaration::new("C").base("A").base("B"));

    assert_eq!(
        builder.build().unwrap_err(),
        RegistryError::InconsistentHierarchy("C".to_owned())
    );
}

#[test]
pub fn declare_job_registers_parameters() {
    let mut builder = RegistryBuilder::new();
    builder.declare_type(TypeDeclaration::new("Base").member("max_num_cpu"));
    builder.register(Identity::new("Base", "max_num_cpu"), max_cpu());
    builder.declare_job(
        JobMetadata::new("resize")
            .parallel()
            .vram_mb(512)
            .base("Base")
            .parameter("width", Argument::scalar("width", ArgumentType::Integer).required())
            .parameter("paths", Argument::list("paths", ArgumentType::String)),
    );

    let registry = builder.build().unwrap();
    let metadata = registry.job("resize").unwrap();

    assert!(metadata.parallel);
    assert_eq!(metadata.gpus, GpuRequirement::VramMb(512));
    assert_eq!(
        registry.members("resize"),
        vec!["width", "paths", "max_num_cpu"]
    );
    assert!(registry.resolve("resize", "width").unwrap().required);
    assert_eq!(registry.resolve("resize", "max_num_cpu"), Some(&max_cpu()));
}

#[test]
pub fn explicit_share_wins_over_vram() {
    let metadata = JobMetadata::new("train").num_gpus(0.5).vram_mb(4096);

    assert_eq!(metadata.gpus, GpuRequirement::Share(0.5));
}

#[test]
pub fn global_registry_installs_once() {
    // other tests in this binary never install, so the first attempt wins
    let installed = install(RegistryBuilder::new().build().unwrap()).unwrap();

    assert_eq!(
        install(RegistryBuilder::new().build().unwrap()).map(|_| ()),
        Err(RegistryError::AlreadyInstalled)
    );
    assert_eq!(Arc::strong_count(&installed), 2);
}
