use content_repo::{
    Assignment, AssignmentKind, ContentTypeUpdate, DataType, Error, Id, MemoryStore, Multiplicity, NewContentType,
    NewGroup, NewInstance, NewProperty, Permission, PrimaryKey, RemoveOptions, Repository, Role,
    UserContext, ROOT_TYPE_ID,
};
use serde_json::json;

// Repository wrapper with shorthands for building structures as system
struct TestRepo {
    repo: Repository<MemoryStore>,
    system: UserContext,
}

impl TestRepo {
    fn new() -> Self {
        Self {
            repo: Repository::in_memory().unwrap(),
            system: UserContext::system(),
        }
    }

    fn acl(&self) -> Id {
        self.repo.system().structure_acl
    }

    fn create_type(&self, name: &str, parent: Option<Id>) -> Id {
        let mut new = NewContentType::new(name, self.acl(), self.repo.system().workflow);
        new.parent = parent;
        self.repo.structure.create_type(&self.system, &new).unwrap()
    }

    fn add_property(&self, type_id: Id, name: &str, multiplicity: Multiplicity, parent: &str) -> Id {
        let new = NewProperty::new(name, DataType::String, multiplicity, self.acl());
        self.repo
            .structure
            .create_property(&self.system, type_id, &new, parent, None)
            .unwrap()
    }

    fn add_group(&self, type_id: Id, name: &str, multiplicity: Multiplicity) -> Id {
        self.repo
            .structure
            .create_group(&self.system, type_id, &NewGroup::new(name, multiplicity), "/", None)
            .unwrap()
    }

    fn assignment(&self, type_id: Id, path: &str) -> Assignment {
        self.repo
            .environment()
            .assignment_by_xpath(type_id, path)
            .unwrap()
            .clone()
    }

    fn has_xpath(&self, type_id: Id, path: &str) -> bool {
        self.repo.environment().assignment_by_xpath(type_id, path).is_ok()
    }

    // structure manager allowed to delete the data of removed properties
    fn manager(&self) -> UserContext {
        UserContext::new(5)
            .with_role(Role::StructureManagement)
            .grant(self.acl(), &[Permission::Delete])
    }
}

#[test]
fn test_document_title_workflow() {
    let t = TestRepo::new();

    println!("1. Creating DOCUMENT with a required TITLE");
    let doc = t.create_type("DOCUMENT", None);
    let title = t.add_property(doc, "TITLE", Multiplicity::ONE, "/");
    let env = t.repo.environment();
    assert_eq!(env.root_assignments(doc, true).len(), 21);
    let title = env.assignment(title).unwrap();
    assert_eq!(title.xpath, "DOCUMENT/TITLE");
    assert_eq!(title.position, 20);

    println!("2. Callers without the structure role are turned away");
    let outsider = UserContext::new(9);
    let err = t
        .repo
        .structure
        .create_property(
            &outsider,
            doc,
            &NewProperty::new("SUBTITLE", DataType::String, Multiplicity::ZERO_OR_ONE, t.acl()),
            "/",
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NoAccess { .. }));
    assert_eq!(err.key(), "ex.acl.role.missing");

    println!("3. System-internal assignments cannot be removed");
    let id = t.assignment(doc, "/ID");
    let err = t
        .repo
        .structure
        .remove_assignment(&t.manager(), id.id, RemoveOptions::default())
        .unwrap_err();
    assert_eq!(err.key(), "ex.structure.assignment.delete.systemInternal");

    println!("4. Instances validate once TITLE is set");
    let mut content = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(doc, 1))
        .unwrap();
    assert_eq!(content.check_validity().unwrap_err().key(), "ex.content.required.missing");
    content.set_json(&env, "/TITLE", json!("Hello")).unwrap();
    content.check_validity().unwrap();
    let pk = t.repo.content.save(&t.system, content, false).unwrap();
    assert_eq!(pk, PrimaryKey::new(pk.id, 1));
}

#[test]
fn test_derived_types_inherit_and_propagate() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    let title = t.add_property(doc, "TITLE", Multiplicity::ONE, "/");

    let page = t.create_type("PAGE", Some(doc));
    let page_title = t.assignment(page, "/TITLE");
    assert_eq!(page_title.base, Some(title));
    assert_eq!(page_title.xpath, "PAGE/TITLE");
    assert_eq!(page_title.position, 20);
    assert!(t.assignment(page, "/ID").is_system_internal());

    let blog = t.create_type("BLOG", Some(page));

    // new assignments on the base flow down the whole chain
    let summary = t.add_property(doc, "SUMMARY", Multiplicity::ZERO_OR_ONE, "/");
    let page_summary = t.assignment(page, "/SUMMARY");
    assert_eq!(page_summary.base, Some(summary));
    assert_eq!(t.assignment(blog, "/SUMMARY").base, Some(page_summary.id));

    let meta = t.add_group(doc, "META", Multiplicity::ZERO_OR_ONE);
    t.add_property(doc, "AUTHOR", Multiplicity::ZERO_OR_ONE, "/META");
    let page_meta = t.assignment(page, "/META");
    assert_eq!(page_meta.base, Some(meta));
    let page_author = t.assignment(page, "/META/AUTHOR");
    assert_eq!(page_author.parent_group, Some(page_meta.id));
    assert_eq!(page_author.xpath, "PAGE/META/AUTHOR");
    assert!(t.has_xpath(blog, "/META/AUTHOR"));

    // inherited assignments need an explicit opt-in to be removed
    let err = t
        .repo
        .structure
        .remove_assignment(&t.manager(), page_title.id, RemoveOptions::default())
        .unwrap_err();
    assert_eq!(err.key(), "ex.structure.assignment.delete.derived");

    let options = RemoveOptions {
        allow_derived_removal: true,
        ..RemoveOptions::default()
    };
    let removed = t
        .repo
        .structure
        .remove_assignment(&t.manager(), page_title.id, options)
        .unwrap();
    assert_eq!(removed, 2);
    assert!(t.has_xpath(doc, "/TITLE"));
    assert!(!t.has_xpath(page, "/TITLE"));
    assert!(!t.has_xpath(blog, "/TITLE"));
}

#[test]
fn test_breaking_inheritance_keeps_derived_copies() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    let title = t.add_property(doc, "TITLE", Multiplicity::ONE, "/");
    let page = t.create_type("PAGE", Some(doc));

    let removed = t
        .repo
        .structure
        .remove_assignment(&t.system, title, RemoveOptions::break_inheritance())
        .unwrap();
    assert_eq!(removed, 1);
    assert!(!t.has_xpath(doc, "/TITLE"));
    let detached = t.assignment(page, "/TITLE");
    assert_eq!(detached.base, None);
    // still referenced by PAGE
    assert!(t.repo.environment().property_by_name("TITLE").is_ok());
}

#[test]
fn test_removal_cascades_and_collects_orphans() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    let title = t.add_property(doc, "TITLE", Multiplicity::ONE, "/");
    let page = t.create_type("PAGE", Some(doc));

    let removed = t
        .repo
        .structure
        .remove_assignment(&t.system, title, RemoveOptions::default())
        .unwrap();
    assert_eq!(removed, 2);
    assert!(!t.has_xpath(page, "/TITLE"));
    assert!(t.repo.environment().property_by_name("TITLE").is_err());

    let group = t.add_group(doc, "ADDRESS", Multiplicity::ZERO_OR_MORE);
    t.add_property(doc, "STREET", Multiplicity::ONE, "/ADDRESS");
    let keep_children = RemoveOptions {
        remove_sub_assignments: false,
        ..RemoveOptions::default()
    };
    let err = t
        .repo
        .structure
        .remove_assignment(&t.system, group, keep_children)
        .unwrap_err();
    assert_eq!(err.key(), "ex.structure.assignment.delete.hasChildren");

    let group_id = t.assignment(doc, "/ADDRESS").group_id().unwrap();
    assert_eq!(t.repo.structure.remove_group(&t.system, group_id).unwrap(), 4);
    assert!(!t.has_xpath(page, "/ADDRESS/STREET"));
    assert!(t.repo.environment().group(group_id).is_err());
    assert!(t.repo.environment().property_by_name("STREET").is_err());
}

#[test]
fn test_auto_unique_property_names() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    t.add_property(doc, "COLOR", Multiplicity::ZERO_OR_ONE, "/");

    let mut new = NewProperty::new("color", DataType::String, Multiplicity::ZERO_OR_ONE, t.acl());
    let err = t
        .repo
        .structure
        .create_property(&t.system, doc, &new, "/", Some("TINT"))
        .unwrap_err();
    assert!(matches!(err, Error::EntryExists(_)));
    assert_eq!(err.key(), "ex.structure.property.exists");
    assert!(!t.has_xpath(doc, "/TINT"));

    new.auto_unique_name = true;
    let tint = t
        .repo
        .structure
        .create_property(&t.system, doc, &new, "/", Some("TINT"))
        .unwrap();
    let again = t
        .repo
        .structure
        .create_property(&t.system, doc, &new, "/", Some("HUE"))
        .unwrap();

    let env = t.repo.environment();
    let name = |id: Id| {
        let property = env.assignment(id).unwrap().property_id().unwrap();
        env.property(property).unwrap().name.clone()
    };
    assert_eq!(name(tint), "COLOR_1");
    assert_eq!(name(again), "COLOR_2");
}

#[test]
fn test_multiplicity_narrowing_checks_stored_data() {
    let t = TestRepo::new();
    let note = t.create_type("NOTE", None);
    let tags = t.add_property(note, "TAGS", Multiplicity::ZERO_OR_MORE, "/");

    let env = t.repo.environment();
    let mut content = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(note, 1))
        .unwrap();
    for i in 1..=3 {
        content
            .set_json(&env, &format!("/TAGS[{}]", i), json!(format!("tag{}", i)))
            .unwrap();
    }
    t.repo.content.save(&t.system, content, false).unwrap();

    let mut assignment = t.assignment(note, "/TAGS");
    assignment.multiplicity = Multiplicity::new(0, Some(2)).unwrap();
    let err = t
        .repo
        .structure
        .save_assignment(&t.system, &assignment)
        .unwrap_err();
    assert_eq!(err.key(), "ex.structure.modification.contentExists.maxMultiplicity");

    assignment.multiplicity = Multiplicity::new(0, Some(5)).unwrap();
    assert_eq!(t.repo.structure.save_assignment(&t.system, &assignment).unwrap(), tags);
    assert_eq!(
        t.assignment(note, "/TAGS").multiplicity,
        Multiplicity::new(0, Some(5)).unwrap()
    );

    assignment.multiplicity = Multiplicity::new(4, Some(5)).unwrap();
    let err = t
        .repo
        .structure
        .save_assignment(&t.system, &assignment)
        .unwrap_err();
    assert_eq!(err.key(), "ex.structure.modification.contentExists.minMultiplicity");
}

#[test]
fn test_narrowing_ignores_empty_occurrences() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    t.add_property(doc, "TITLE", Multiplicity::ZERO_OR_ONE, "/");

    println!("1. Saving an instance whose TITLE stays empty");
    let content = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(doc, 1))
        .unwrap();
    assert!(content.contains_xpath("/TITLE"));
    let empty = t.repo.content.save(&t.system, content, false).unwrap();

    println!("2. Requiring TITLE fails, the stored instance has no value");
    let mut assignment = t.assignment(doc, "/TITLE");
    assignment.multiplicity = Multiplicity::ONE;
    let err = t
        .repo
        .structure
        .save_assignment(&t.system, &assignment)
        .unwrap_err();
    assert_eq!(err.key(), "ex.structure.modification.contentExists.minMultiplicity");
    assert_eq!(t.assignment(doc, "/TITLE").multiplicity, Multiplicity::ZERO_OR_ONE);

    println!("3. Once every instance has a TITLE the narrowing is accepted");
    let env = t.repo.environment();
    let mut filled = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(doc, 1))
        .unwrap();
    filled.set_json(&env, "/TITLE", json!("Kept")).unwrap();
    t.repo.content.save(&t.system, filled, false).unwrap();
    assert!(t.repo.structure.save_assignment(&t.system, &assignment).is_err());
    t.repo.content.remove(&t.system, empty.id).unwrap();
    t.repo.structure.save_assignment(&t.system, &assignment).unwrap();
    assert_eq!(t.assignment(doc, "/TITLE").multiplicity, Multiplicity::ONE);
}

#[test]
fn test_group_rename_moves_paths_and_data() {
    let t = TestRepo::new();
    let contact = t.create_type("CONTACT", None);
    t.add_property(contact, "NOTE", Multiplicity::ZERO_OR_ONE, "/");
    let address = t.add_group(contact, "ADDRESS", Multiplicity::ZERO_OR_ONE);
    t.add_property(contact, "STREET", Multiplicity::ZERO_OR_ONE, "/ADDRESS");

    let env = t.repo.environment();
    let mut content = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(contact, 1))
        .unwrap();
    content.set_json(&env, "/ADDRESS/STREET", json!("Main Street")).unwrap();
    let pk = t.repo.content.save(&t.system, content, false).unwrap();

    let mut group = t.assignment(contact, "/ADDRESS");
    group.alias = "NOTE".to_string();
    let err = t.repo.structure.save_assignment(&t.system, &group).unwrap_err();
    assert!(matches!(err, Error::EntryExists(_)));

    group.alias = "location".to_string();
    assert_eq!(t.repo.structure.save_assignment(&t.system, &group).unwrap(), address);
    assert!(!t.has_xpath(contact, "/ADDRESS"));
    assert_eq!(t.assignment(contact, "/LOCATION/STREET").xpath, "CONTACT/LOCATION/STREET");

    let loaded = t.repo.content.load(&t.system, &PrimaryKey::max(pk.id)).unwrap();
    assert_eq!(
        loaded.value("/LOCATION/STREET").unwrap().default_translation(),
        Some(&json!("Main Street"))
    );
    assert!(!loaded.contains_xpath("/ADDRESS"));
}

#[test]
fn test_disable_drops_data_and_enable_restores_structure() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    let title = t.add_property(doc, "TITLE", Multiplicity::ZERO_OR_ONE, "/");

    let env = t.repo.environment();
    let mut content = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(doc, 1))
        .unwrap();
    content.set_json(&env, "/TITLE", json!("Draft")).unwrap();
    let pk = t.repo.content.save(&t.system, content, false).unwrap();

    t.repo.structure.disable_assignment(&t.system, title).unwrap();
    assert!(!t.repo.environment().assignment(title).unwrap().enabled);
    let loaded = t.repo.content.load(&t.system, &pk).unwrap();
    assert!(!loaded.contains_xpath("/TITLE"));
    let mut fresh = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(doc, 1))
        .unwrap();
    assert!(!fresh.contains_xpath("/TITLE"));
    // a disabled assignment takes no new data
    let err = fresh
        .set_json(&t.repo.environment(), "/TITLE", json!("ghost"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
    assert_eq!(err.key(), "ex.content.xpath.undefined");
    assert!(!fresh.contains_xpath("/TITLE"));

    t.repo.structure.enable_assignment(&t.system, title).unwrap();
    let fresh = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(doc, 1))
        .unwrap();
    assert!(fresh.contains_xpath("/TITLE"));
}

#[test]
fn test_positions_stay_behind_system_properties() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    let a = t.add_property(doc, "FIRST", Multiplicity::ZERO_OR_ONE, "/");
    let b = t.add_property(doc, "SECOND", Multiplicity::ZERO_OR_ONE, "/");
    let c = t.add_property(doc, "THIRD", Multiplicity::ZERO_OR_ONE, "/");

    assert_eq!(t.repo.structure.set_assignment_position(&t.system, c, 0).unwrap(), 20);
    let env = t.repo.environment();
    let order: Vec<(Id, i32)> = [c, a, b]
        .iter()
        .map(|id| (*id, env.assignment(*id).unwrap().position))
        .collect();
    assert_eq!(order, vec![(c, 20), (a, 21), (b, 22)]);

    assert_eq!(t.repo.structure.set_assignment_position(&t.system, c, 99).unwrap(), 22);
    assert_eq!(t.repo.environment().assignment(b).unwrap().position, 21);
}

#[test]
fn test_type_removal_rules() {
    let t = TestRepo::new();
    let err = t.repo.structure.remove_type(&t.system, ROOT_TYPE_ID).unwrap_err();
    assert_eq!(err.key(), "ex.structure.type.delete.root");

    let doc = t.create_type("DOCUMENT", None);
    let page = t.create_type("PAGE", Some(doc));
    let err = t.repo.structure.remove_type(&t.system, doc).unwrap_err();
    assert_eq!(err.key(), "ex.structure.type.inUse.derived");

    let used = t.create_type("USED", None);
    let content = t
        .repo
        .content
        .initialize(&t.system, NewInstance::of_type(used, 1))
        .unwrap();
    t.repo.content.save(&t.system, content, false).unwrap();
    let err = t.repo.structure.remove_type(&t.system, used).unwrap_err();
    assert_eq!(err.key(), "ex.structure.type.inUse");

    let scratch = t.create_type("SCRATCH", None);
    t.add_property(scratch, "SCRATCHPAD", Multiplicity::ZERO_OR_ONE, "/");
    t.repo.structure.remove_type(&t.system, scratch).unwrap();
    let env = t.repo.environment();
    assert!(env.content_type(scratch).is_err());
    assert!(env.property_by_name("SCRATCHPAD").is_err());
    assert!(env.property_by_name("ID").is_ok());
    assert_eq!(env.system_internal_root_count(), 20);

    t.repo.structure.remove_type(&t.system, page).unwrap();
    t.repo.structure.remove_type(&t.system, doc).unwrap();
    assert!(t.repo.environment().content_type(doc).is_err());
}

#[test]
fn test_type_rename_rewrites_assignment_xpaths() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    let title = t.add_property(doc, "TITLE", Multiplicity::ONE, "/");

    let update = ContentTypeUpdate {
        name: Some("article".to_string()),
        max_versions: Some(5),
        ..ContentTypeUpdate::default()
    };
    t.repo.structure.update_type(&t.system, doc, &update).unwrap();

    let env = t.repo.environment();
    assert_eq!(env.content_type(doc).unwrap().name, "ARTICLE");
    assert_eq!(env.assignment(title).unwrap().xpath, "ARTICLE/TITLE");
    assert!(env.assignment_by_full_xpath("ARTICLE/TITLE").is_ok());

    let changed: Vec<String> = t
        .repo
        .store()
        .history()
        .into_iter()
        .filter(|h| h.key == "history.type.update")
        .map(|h| h.args[1].clone())
        .collect();
    assert_eq!(changed, vec!["name".to_string(), "maxVersions".to_string()]);
}

#[test]
fn test_history_failures_do_not_block_writes() {
    let t = TestRepo::new();
    t.repo.store().set_history_failure(true);
    let doc = t.create_type("DOCUMENT", None);
    assert!(t.repo.store().history().is_empty());

    t.repo.store().set_history_failure(false);
    t.add_property(doc, "TITLE", Multiplicity::ONE, "/");
    let keys: Vec<String> = t.repo.store().history().into_iter().map(|h| h.key).collect();
    assert_eq!(keys, vec!["history.assignment.createProperty".to_string()]);
}

#[test]
fn test_identity_fields_cannot_be_modified() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    t.add_property(doc, "TITLE", Multiplicity::ONE, "/");
    let meta = t.add_group(doc, "META", Multiplicity::ZERO_OR_ONE);
    let page = t.create_type("PAGE", Some(doc));
    let title = t.assignment(doc, "/TITLE");

    let rejected = |updated: &Assignment| {
        let err = t
            .repo
            .structure
            .save_assignment(&t.system, updated)
            .unwrap_err();
        assert!(matches!(err, Error::Update { .. }));
        assert_eq!(err.key(), "ex.structure.modification.notSupported");
        err.message().args[0].clone()
    };

    println!("1. Alias and XPath are fixed for property assignments");
    let mut renamed = title.clone();
    renamed.alias = "HEADLINE".to_string();
    assert_eq!(rejected(&renamed), "alias");
    let mut moved = title.clone();
    moved.xpath = "DOCUMENT/HEADLINE".to_string();
    assert_eq!(rejected(&moved), "alias");

    println!("2. The assigned property is fixed");
    let id_property = t.repo.environment().property_by_name("ID").unwrap().id;
    let mut swapped = title.clone();
    if let AssignmentKind::Property { property_id, .. } = &mut swapped.kind {
        *property_id = id_property;
    }
    assert_eq!(rejected(&swapped), "property");

    println!("3. Parent group and base assignment are fixed");
    let mut regrouped = title.clone();
    regrouped.parent_group = Some(meta);
    assert_eq!(rejected(&regrouped), "parentGroupAssignment");
    let mut rebased = t.assignment(page, "/TITLE");
    assert!(rebased.base.is_some());
    rebased.base = None;
    assert_eq!(rejected(&rebased), "baseAssignment");

    println!("4. Property name and data type are fixed");
    let mut property = t.repo.environment().property_by_name("TITLE").unwrap().clone();
    property.name = "HEADLINE".to_string();
    let err = t.repo.structure.update_property(&t.system, &property).unwrap_err();
    assert!(matches!(err, Error::Update { .. }));
    assert_eq!(err.key(), "ex.structure.modification.notSupported");
    assert_eq!(err.message().args[0], "name");

    let unchanged = t.assignment(doc, "/TITLE");
    assert_eq!(unchanged.alias, "TITLE");
    assert_eq!(unchanged.parent_group, title.parent_group);
}

#[test]
fn test_system_internal_is_one_way_and_supervisor_only() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);
    t.add_property(doc, "TITLE", Multiplicity::ONE, "/");
    let env = t.repo.environment();

    println!("1. A system-internal property cannot be unset, even by the system");
    let mut id = env.property_by_name("ID").unwrap().clone();
    assert!(id.system_internal);
    id.system_internal = false;
    let err = t.repo.structure.update_property(&t.system, &id).unwrap_err();
    assert!(matches!(err, Error::Update { .. }));
    assert_eq!(err.key(), "ex.structure.systemInternal.unset");
    assert!(t.assignment(doc, "/ID").set_system_internal(false).is_err());

    println!("2. Setting the flag needs a supervisor");
    let mut title = env.property_by_name("TITLE").unwrap().clone();
    title.system_internal = true;
    let err = t.repo.structure.update_property(&t.manager(), &title).unwrap_err();
    assert!(matches!(err, Error::NoAccess { .. }));
    assert_eq!(err.key(), "ex.structure.systemInternal.supervisorOnly");
    assert!(!t.repo.environment().property_by_name("TITLE").unwrap().system_internal);

    t.repo
        .structure
        .update_property(&UserContext::supervisor(1), &title)
        .unwrap();
    assert!(t.repo.environment().property_by_name("TITLE").unwrap().system_internal);
}

#[test]
fn test_reload_failure_after_commit_keeps_the_write() {
    let t = TestRepo::new();
    let doc = t.create_type("DOCUMENT", None);

    println!("1. The write commits but the snapshot reload fails");
    t.repo.store().set_reload_failure(true);
    let new = NewProperty::new("TITLE", DataType::String, Multiplicity::ONE, t.acl());
    let err = t
        .repo
        .structure
        .create_property(&t.system, doc, &new, "/", None)
        .unwrap_err();
    assert!(matches!(err, Error::Cache(_)));
    assert_eq!(err.key(), "ex.cache.reload");
    assert!(!t.has_xpath(doc, "/TITLE"));

    println!("2. The next successful reload shows the committed property");
    t.repo.store().set_reload_failure(false);
    t.add_property(doc, "SUBTITLE", Multiplicity::ZERO_OR_ONE, "/");
    assert!(t.has_xpath(doc, "/TITLE"));
    assert!(t.has_xpath(doc, "/SUBTITLE"));
}
