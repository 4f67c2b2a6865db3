use docmodel::{bson::{Bson, doc}, memory::InMemoryStore, prelude::*};
use std::sync::Arc;

async fn connection() -> Connection {
    Connection::open(InMemoryStore::new()).await.unwrap()
}

fn people_schema() -> Schema {
    Schema::new()
        .add("name", SchemaType::string())
        .add("age", SchemaType::number().default_value(0))
}

#[tokio::test]
async fn name_and_age_scenario() {
    let connection = connection().await;
    let people = connection.model("Person", people_schema());

    let created = people.create(doc! { "name": "a" }).await.unwrap();
    assert_eq!(created.get_raw("age"), Some(&Bson::Int32(0)));

    let found = people
        .find(doc! {})
        .where_field("age")
        .gte(0)
        .exec()
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), created.id());

    let deleted = people.delete_many(doc! { "name": "a" }).await.unwrap();
    assert_eq!(deleted.deleted_count, 1);
    assert!(people.find(doc! {}).exec().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_required_fields_block_create() {
    let connection = connection().await;
    let people = connection.model(
        "Person",
        Schema::new()
            .add("name", SchemaType::string().required())
            .add("email", SchemaType::string().required().default_value("none")),
    );

    let err = people.create(doc! { "age": 3 }).await.unwrap_err();
    assert_eq!(err.validation_errors(), Some(&["name is required".to_string()][..]));
    assert_eq!(people.count_documents(doc! {}).await.unwrap(), 0);

    let errors = people.schema().validate(&doc! {}).await;
    assert_eq!(errors, vec!["name is required", "email is required"]);
}

#[tokio::test]
async fn create_then_find_one_round_trips() {
    let connection = connection().await;
    let people = connection.model("Person", people_schema());

    let created = people
        .create(doc! { "name": "b", "nested": { "x": [1, 2] } })
        .await
        .unwrap();
    let id = created.id().unwrap().to_string();

    let found = people
        .find_one(doc! { "_id": id.as_str() })
        .await
        .unwrap()
        .unwrap();
    let object = found.to_object();

    assert_eq!(object, created.to_object());
    assert_eq!(object.get_str("_id").unwrap(), id);
    assert_eq!(object.get_str("name").unwrap(), "b");
    assert_eq!(object.get_i32("age").unwrap(), 0);
    assert_eq!(object.get_document("nested").unwrap(), &doc! { "x": [1, 2] });
    assert!(object.get_datetime("createdAt").is_ok());
    assert!(object.get_datetime("updatedAt").is_ok());
}

#[tokio::test]
async fn updates_merge_plain_documents_and_apply_operators() {
    let connection = connection().await;
    let people = connection.model("Person", people_schema());
    people
        .create(doc! { "name": "c", "age": 1, "profile": { "city": "Oslo", "zip": "0150" } })
        .await
        .unwrap();

    // Without `$` keys the update replaces top-level fields wholesale.
    people
        .update_one(doc! { "name": "c" }, doc! { "profile": { "city": "Rome" } })
        .await
        .unwrap();
    let stored = people.find_one(doc! { "name": "c" }).await.unwrap().unwrap();
    assert_eq!(stored.get_raw("profile"), Some(&Bson::Document(doc! { "city": "Rome" })));

    // Operators touch only the paths they name.
    people
        .update_one(
            doc! { "name": "c" },
            doc! { "$set": { "profile.zip": "00100" }, "$inc": { "age": 2 } },
        )
        .await
        .unwrap();
    let stored = people.find_one(doc! { "name": "c" }).await.unwrap().unwrap();
    assert_eq!(stored.get_raw("profile"), Some(&Bson::Document(doc! { "city": "Rome", "zip": "00100" })));
    assert_eq!(stored.get_raw("age"), Some(&Bson::Int32(3)));

    let before = stored.get_raw("updatedAt").cloned();
    let noop = people.update_one(doc! { "name": "c" }, doc! { "$set": { "age": 3 } }).await.unwrap();
    assert_eq!((noop.matched_count, noop.modified_count), (1, 0));

    let stored = people.find_one(doc! { "name": "c" }).await.unwrap().unwrap();
    assert_eq!(stored.get_raw("updatedAt").cloned(), before);
}

#[tokio::test]
async fn serialized_writes_lose_nothing() {
    let connection = connection().await;
    let people = connection.model("Person", people_schema());

    let records = (0..50).map(|n| doc! { "name": format!("p{n}"), "age": n }).collect();
    let created = people.create_many(records).await.unwrap();

    assert_eq!(created.len(), 50);
    assert_eq!(people.count_documents(doc! {}).await.unwrap(), 50);

    let tasks = (0..20).map(|_| {
        let people = people.clone();
        tokio::spawn(async move {
            people
                .update_one(doc! { "name": "p0" }, doc! { "$inc": { "age": 1 } })
                .await
        })
    });
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let p0 = people.find_one(doc! { "name": "p0" }).await.unwrap().unwrap();
    assert_eq!(p0.get_raw("age"), Some(&Bson::Int32(20)));
}

#[tokio::test]
async fn hooks_methods_and_statics() {
    let connection = connection().await;
    let schema = people_schema();

    schema.pre(HookAction::Save, |record| {
        if record.get_str("name").is_ok_and(|name| name.is_empty()) {
            return Err(ModelError::InvalidDocument("empty name".to_string()));
        }
        Ok(())
    });
    schema.method("birthday", |doc, _| {
        let age = doc.get_raw("age").and_then(Bson::as_i32).unwrap_or(0) + 1;
        doc.set("age", age)?;
        Ok(Bson::Int32(age))
    });
    schema.static_fn("adults", |model: Model, _| async move {
        let count = model.count_documents(doc! { "age": { "$gte": 18 } }).await?;
        Ok(Bson::Int64(count as i64))
    });

    let people = connection.model("Person", Arc::new(schema));
    assert!(people.create(doc! { "name": "" }).await.is_err());

    let mut teen = people.create(doc! { "name": "t", "age": 17 }).await.unwrap();
    assert_eq!(people.call_static("adults", vec![]).await.unwrap(), Bson::Int64(0));

    assert_eq!(teen.call("birthday", &[]).unwrap(), Bson::Int32(18));
    assert_eq!(teen.get_changes(), doc! { "age": 18 });
    teen.save().await.unwrap();

    assert_eq!(people.call_static("adults", vec![]).await.unwrap(), Bson::Int64(1));
}

#[tokio::test]
async fn typed_values_in_and_out() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Person {
        name: String,
        age: i32,
    }

    let connection = connection().await;
    let people = connection.model("Person", people_schema());

    let created = people
        .create_from(&Person { name: "Ada".to_string(), age: 36 })
        .await
        .unwrap();
    let found = people.find_by_id(created.id().unwrap()).await.unwrap().unwrap();

    assert_eq!(found.deserialize::<Person>().unwrap(), Person { name: "Ada".to_string(), age: 36 });
    assert_eq!(found.to_json()["name"], "Ada");
}
