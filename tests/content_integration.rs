use content_repo::{
    Content, DataType, DeltaEngine, Error, GroupMode, Id, InsertPosition, MemoryStore,
    Multiplicity, NewContentType, NewGroup, NewInstance, NewProperty, Permission, PermissionSet,
    PrimaryKey, Repository, UserContext, ValueAccess,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

struct Fixture {
    repo: Repository<MemoryStore>,
    system: UserContext,
    article: Id,
}

// ARTICLE: TITLE (1), AUTHOR (0..3) { NAME (0..1) }
fn fixture() -> Fixture {
    let repo = Repository::in_memory().unwrap();
    let system = UserContext::system();
    let ids = *repo.system();
    let article = repo
        .structure
        .create_type(&system, &NewContentType::new("ARTICLE", ids.structure_acl, ids.workflow))
        .unwrap();
    let string = |name: &str, multiplicity| {
        NewProperty::new(name, DataType::String, multiplicity, ids.structure_acl)
    };
    repo.structure
        .create_property(&system, article, &string("TITLE", Multiplicity::ONE), "/", None)
        .unwrap();
    let author = NewGroup::new("AUTHOR", Multiplicity::new(0, Some(3)).unwrap());
    repo.structure
        .create_group(&system, article, &author, "/", None)
        .unwrap();
    repo.structure
        .create_property(&system, article, &string("NAME", Multiplicity::ZERO_OR_ONE), "/AUTHOR", None)
        .unwrap();
    Fixture { repo, system, article }
}

impl Fixture {
    fn new_instance(&self) -> NewInstance {
        NewInstance {
            acl: Some(self.repo.system().instance_acl),
            ..NewInstance::of_type(self.article, 1)
        }
    }

    fn save_titled(&self, title: &str) -> PrimaryKey {
        let env = self.repo.environment();
        let mut content = self.repo.content.initialize(&self.system, self.new_instance()).unwrap();
        content.set_json(&env, "/TITLE", json!(title)).unwrap();
        self.repo.content.save(&self.system, content, false).unwrap()
    }

    fn title(&self, content: &Content) -> String {
        content
            .value("/TITLE")
            .unwrap()
            .default_translation()
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string()
    }

    fn random_content(&self, seed: u64) -> Content {
        let env = self.repo.environment();
        let mut content = self.repo.content.initialize(&self.system, self.new_instance()).unwrap();
        content.randomize(&env, &mut StdRng::seed_from_u64(seed), 3).unwrap();
        content
    }
}

#[test]
fn test_save_load_and_versioning() {
    let f = fixture();
    let env = f.repo.environment();

    println!("1. First save creates version 1");
    let pk = f.save_titled("Draft");
    assert_eq!(pk, PrimaryKey::new(pk.id, 1));
    let loaded = f.repo.content.load(&f.system, &PrimaryKey::max(pk.id)).unwrap();
    assert_eq!(loaded.pk, pk);
    assert_eq!(loaded.max_version, Some(1));
    assert_eq!(f.title(&loaded), "Draft");

    println!("2. Saving unchanged content keeps the stored version");
    let again = f.repo.content.save(&f.system, loaded.clone(), false).unwrap();
    assert_eq!(again, pk);

    println!("3. A new version leaves the old one loadable");
    let mut edited = loaded;
    edited.set_json(&env, "/TITLE", json!("Final")).unwrap();
    let v2 = f.repo.content.save(&f.system, edited, true).unwrap();
    assert_eq!(v2, PrimaryKey::new(pk.id, 2));
    let old = f.repo.content.load(&f.system, &PrimaryKey::new(pk.id, 1)).unwrap();
    assert_eq!(f.title(&old), "Draft");
    let max = f.repo.content.load(&f.system, &PrimaryKey::max(pk.id)).unwrap();
    assert_eq!(max.pk, v2);
    assert_eq!(f.title(&max), "Final");

    println!("4. Removal drops every version");
    f.repo.content.remove(&f.system, pk.id).unwrap();
    let err = f.repo.content.load(&f.system, &PrimaryKey::max(pk.id)).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(err.key(), "ex.content.notFound");
}

#[test]
fn test_invalid_content_is_not_saved() {
    let f = fixture();
    let content = f.repo.content.initialize(&f.system, f.new_instance()).unwrap();
    let err = f.repo.content.save(&f.system, content, false).unwrap_err();
    assert_eq!(err.key(), "ex.content.required.missing");
}

#[test]
fn test_read_requires_every_enabled_layer() {
    let f = fixture();
    let ids = *f.repo.system();
    let pk = f.save_titled("Secret");

    let reader = UserContext::new(8)
        .grant(ids.structure_acl, &[Permission::Read])
        .grant(ids.instance_acl, &[Permission::Read]);
    let err = f.repo.content.load(&reader, &pk).unwrap_err();
    match err {
        Error::NoAccess { acls, .. } => assert_eq!(acls, vec!["Default Workflow ACL".to_string()]),
        other => panic!("unexpected error {:?}", other),
    }

    let reader = reader.grant(ids.workflow_acl, &[Permission::Read]);
    let content = f.repo.content.load(&reader, &pk).unwrap();
    // readable but not editable through the property ACL
    assert_eq!(content.value("/TITLE").unwrap().access, ValueAccess::ReadOnly);
    assert_eq!(f.repo.content.permissions(&reader, &pk).unwrap(), PermissionSet::default());

    let editor = reader
        .clone()
        .grant(ids.structure_acl, &[Permission::Edit])
        .grant(ids.workflow_acl, &[Permission::Edit])
        .grant(ids.instance_acl, &[Permission::Edit]);
    let set = f.repo.content.permissions(&editor, &pk).unwrap();
    assert!(set.edit);
    assert!(!set.delete);

    let err = f.repo.content.remove(&reader, pk.id).unwrap_err();
    assert!(matches!(err, Error::NoAccess { .. }));
    assert!(f.repo.content.load(&f.system, &pk).is_ok());
}

#[test]
fn test_supervisor_sees_everything() {
    let f = fixture();
    let pk = f.save_titled("Visible");
    let content = f.repo.content.load(&UserContext::supervisor(2), &pk).unwrap();
    assert_eq!(content.value("/TITLE").unwrap().access, ValueAccess::Full);
}

#[test]
fn test_one_of_group_holds_a_single_child_kind() {
    let f = fixture();
    let ids = *f.repo.system();

    println!("1. Add a one-of CONTACT group with EMAIL and PHONE");
    let mut contact = NewGroup::new("CONTACT", Multiplicity::ZERO_OR_ONE);
    contact.mode = GroupMode::OneOf;
    f.repo
        .structure
        .create_group(&f.system, f.article, &contact, "/", None)
        .unwrap();
    for name in ["EMAIL", "PHONE"] {
        let property =
            NewProperty::new(name, DataType::String, Multiplicity::ZERO_OR_ONE, ids.structure_acl);
        f.repo
            .structure
            .create_property(&f.system, f.article, &property, "/CONTACT", None)
            .unwrap();
    }

    println!("2. The first child is accepted");
    let env = f.repo.environment();
    let mut content = f.repo.content.initialize(&f.system, f.new_instance()).unwrap();
    content.set_json(&env, "/CONTACT/EMAIL", json!("desk@example.org")).unwrap();

    println!("3. A second distinct child is rejected");
    let err = content.set_json(&env, "/CONTACT/PHONE", json!("555-0100")).unwrap_err();
    assert!(matches!(err, Error::Create { .. }));
    assert_eq!(err.key(), "ex.content.xpath.group.oneof");
    assert!(!content.contains_xpath("/CONTACT/PHONE"));
    assert!(content.contains_xpath("/CONTACT/EMAIL"));
}

#[test]
fn test_create_new_stops_at_max_multiplicity() {
    let f = fixture();
    let env = f.repo.environment();
    let mut content = f.repo.content.initialize(&f.system, f.new_instance()).unwrap();

    println!("1. A single-valued property cannot grow");
    let title = content.get_property_data("/TITLE").unwrap();
    let err = content.create_new(&env, title, InsertPosition::Bottom).unwrap_err();
    assert!(matches!(err, Error::Create { .. }));
    assert_eq!(err.key(), "ex.content.data.create.maxMultiplicity");

    println!("2. AUTHOR grows up to three occurrences");
    let author = content.create_xpath(&env, "/AUTHOR").unwrap();
    while !content.contains_xpath("/AUTHOR[3]") {
        content.create_new(&env, author, InsertPosition::Bottom).unwrap();
    }

    println!("3. A fourth AUTHOR is refused");
    let err = content.create_new(&env, author, InsertPosition::Bottom).unwrap_err();
    assert!(matches!(err, Error::Create { .. }));
    assert_eq!(err.key(), "ex.content.data.create.maxMultiplicity");
    assert!(!content.contains_xpath("/AUTHOR[4]"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_delta_of_identical_contents_is_empty(seed in any::<u64>()) {
        let f = fixture();
        let content = f.random_content(seed);
        let delta = DeltaEngine::process(&content, &content).unwrap();
        prop_assert!(!delta.changes());
    }

    #[test]
    fn prop_delta_adds_mirror_removes(a in any::<u64>(), b in any::<u64>()) {
        let f = fixture();
        let first = f.random_content(a);
        let second = f.random_content(b);
        let forward = DeltaEngine::process(&first, &second).unwrap();
        let backward = DeltaEngine::process(&second, &first).unwrap();
        prop_assert_eq!(forward.adds.len(), backward.removes.len());
        prop_assert_eq!(forward.removes.len(), backward.adds.len());
        prop_assert_eq!(forward.updates.len(), backward.updates.len());
    }
}
