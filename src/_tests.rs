#[cfg(test)]
pub mod fixtures {
    use serde_json::json;
    use crate::{
        config::TranslationOptions,
        metadata::Model,
        translation::QueryCompilationContext
    };

    /// Shop model plus three inheritance hierarchies, one per mapping strategy.
    pub fn model() -> Model {
        let def = json!({
            "entity_types": [
                {
                    "name": "Customer", "table": { "name": "Customers" }, "key": ["Id"],
                    "properties": [
                        { "name": "Id",       "kind": "Int" },
                        { "name": "Name",     "kind": "String", "comparer": "CaseInsensitive" },
                        { "name": "City",     "kind": "String", "nullable": true },
                        { "name": "IsActive", "kind": "Bool" }
                    ],
                    "complex_properties": [
                        { "name": "Contact", "complex_type": "ContactInfo" }
                    ],
                    "navigations": [
                        { "name": "Orders", "target": "Order", "is_collection": true,
                          "foreign_key": { "dependent_properties": ["CustomerId"], "principal_properties": ["Id"], "required": true } },
                        { "name": "Address", "target": "Address", "owned": true, "json_column": "Address" },
                        { "name": "Phones", "target": "Phone", "owned": true, "is_collection": true, "json_column": "Phones" }
                    ]
                },
                {
                    "name": "Order", "table": { "name": "Orders" }, "key": ["Id"],
                    "properties": [
                        { "name": "Id",         "kind": "Int" },
                        { "name": "CustomerId", "kind": "Int" },
                        { "name": "OrderDate",  "kind": "DateTime" },
                        { "name": "Total",      "kind": "Decimal" },
                        { "name": "Note",       "kind": "String", "nullable": true }
                    ],
                    "navigations": [
                        { "name": "Customer", "target": "Customer", "on_dependent": true,
                          "foreign_key": { "dependent_properties": ["CustomerId"], "principal_properties": ["Id"], "required": true } },
                        { "name": "Lines", "target": "OrderLine", "is_collection": true,
                          "foreign_key": { "dependent_properties": ["OrderId"], "principal_properties": ["Id"], "required": true } }
                    ]
                },
                {
                    "name": "OrderLine", "table": { "name": "OrderLines" }, "key": ["OrderId", "LineNo"],
                    "properties": [
                        { "name": "OrderId",   "kind": "Int" },
                        { "name": "LineNo",    "kind": "Int" },
                        { "name": "ProductId", "kind": "Int", "nullable": true },
                        { "name": "Quantity",  "kind": "Int" }
                    ],
                    "navigations": [
                        { "name": "Order", "target": "Order", "on_dependent": true,
                          "foreign_key": { "dependent_properties": ["OrderId"], "principal_properties": ["Id"], "required": true } },
                        { "name": "Product", "target": "Product", "on_dependent": true,
                          "foreign_key": { "dependent_properties": ["ProductId"], "principal_properties": ["Id"] } }
                    ]
                },
                {
                    "name": "Product", "table": { "name": "Products" }, "key": ["Id"],
                    "properties": [
                        { "name": "Id",         "kind": "Int" },
                        { "name": "Name",       "kind": "String" },
                        { "name": "CategoryId", "kind": "Int" },
                        { "name": "Price",      "kind": "Decimal" }
                    ]
                },
                {
                    "name": "Address", "owned": true,
                    "properties": [
                        { "name": "Street", "kind": "String", "json_name": "street" },
                        { "name": "City",   "kind": "String", "json_name": "city" }
                    ],
                    "navigations": [
                        { "name": "Geo", "target": "GeoPoint", "owned": true, "json_column": "geo" }
                    ]
                },
                {
                    "name": "GeoPoint", "owned": true,
                    "properties": [
                        { "name": "Lat", "kind": "Float" },
                        { "name": "Lng", "kind": "Float" }
                    ]
                },
                {
                    "name": "Phone", "owned": true,
                    "properties": [
                        { "name": "Number", "kind": "String" },
                        { "name": "Kind",   "kind": "String", "nullable": true }
                    ]
                },

                {
                    "name": "Animal", "table": { "name": "Animals" }, "key": ["Id"],
                    "discriminator_property": "Discriminator", "discriminator_value": "Animal",
                    "properties": [
                        { "name": "Id",            "kind": "Int" },
                        { "name": "Name",          "kind": "String" },
                        { "name": "Discriminator", "kind": "String" }
                    ]
                },
                { "name": "Pet", "base_type": "Animal", "is_abstract": true,
                  "properties": [ { "name": "OwnerName", "kind": "String", "nullable": true } ] },
                { "name": "Cat", "base_type": "Pet", "discriminator_value": "Cat",
                  "properties": [ { "name": "Lives", "kind": "Int", "nullable": true } ] },
                { "name": "Dog", "base_type": "Pet", "discriminator_value": "Dog",
                  "properties": [ { "name": "Barks", "kind": "Bool", "nullable": true } ] },
                { "name": "Bird", "base_type": "Animal", "discriminator_value": "Bird",
                  "properties": [ { "name": "WingSpan", "kind": "Float", "nullable": true } ] },

                {
                    "name": "Vehicle", "is_abstract": true, "strategy": "Tpc", "key": ["Id"],
                    "properties": [
                        { "name": "Id",   "kind": "Int" },
                        { "name": "Make", "kind": "String" }
                    ]
                },
                { "name": "Car", "base_type": "Vehicle", "table": { "name": "Cars" }, "discriminator_value": "Car",
                  "properties": [ { "name": "Seats", "kind": "Int" } ] },
                { "name": "Truck", "base_type": "Vehicle", "table": { "name": "Trucks" }, "discriminator_value": "Truck",
                  "properties": [ { "name": "Payload", "kind": "Float" } ] },

                {
                    "name": "Person", "table": { "name": "People" }, "key": ["Id"], "strategy": "Tpt",
                    "discriminator_value": "Person",
                    "properties": [
                        { "name": "Id",   "kind": "Int" },
                        { "name": "Name", "kind": "String" }
                    ]
                },
                { "name": "Employee", "base_type": "Person", "table": { "name": "Employees" }, "discriminator_value": "Employee",
                  "properties": [ { "name": "Salary", "kind": "Decimal" } ] },
                { "name": "Manager", "base_type": "Employee", "table": { "name": "Managers" }, "discriminator_value": "Manager",
                  "properties": [ { "name": "Level", "kind": "Int" } ] }
            ],
            "complex_types": [
                {
                    "name": "ContactInfo",
                    "properties": [
                        { "name": "Email", "kind": "String", "nullable": true },
                        { "name": "Phone", "kind": "String", "nullable": true }
                    ]
                }
            ]
        });
        Model::from_json(def).unwrap()
    }

    pub fn context(model: &Model) -> QueryCompilationContext<'_> {
        QueryCompilationContext::new(model, TranslationOptions::default())
    }

    pub fn split_context(model: &Model) -> QueryCompilationContext<'_> {
        QueryCompilationContext::new(model, TranslationOptions::split_query())
    }
}
