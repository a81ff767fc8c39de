use shopsync_db::load::schema::ColumnType;

/// How a resource is fetched from the Admin API.
#[derive(Debug, Clone, Copy)]
pub enum FetchKind {
    /// REST endpoint: `GET /admin/api/{version}/{path}.json`, paginated via
    /// the `Link` header's `page_info` token.
    Rest {
        path: &'static str,
        /// Root key of the response envelope, e.g. `{"orders": [...]}`.
        envelope: &'static str,
    },
    /// GraphQL connection, paginated via `pageInfo.endCursor`.
    Graphql {
        /// Root field under `data` in the response.
        root: &'static str,
        query: &'static str,
        /// Whether the connection accepts an `updated_at` search filter.
        /// Unfilterable connections are windowed client-side.
        filterable: bool,
        /// Whether the query needs one pass per configured metaobject type.
        per_type: bool,
    },
}

/// Static description of one extractable resource.
#[derive(Debug, Clone, Copy)]
pub struct Resource {
    pub name: &'static str,
    pub table: &'static str,
    pub kind: FetchKind,
    pub key_field: &'static str,
    pub key_type: ColumnType,
    pub updated_at_field: &'static str,
    pub required_scope: &'static str,
    /// Extra query parameters for the first page request.
    pub extra_query: &'static [(&'static str, &'static str)],
}

const INVENTORY_ITEMS_QUERY: &str = "\
query InventoryItems($first: Int!, $after: String, $query: String) {
  inventoryItems(first: $first, after: $after, query: $query) {
    edges {
      node {
        id
        sku
        tracked
        updatedAt
        inventoryLevels(first: 20) {
          edges {
            node {
              location { id name }
              quantities(names: [\"available\", \"incoming\", \"committed\", \"on_hand\", \"reserved\"]) {
                name
                quantity
              }
            }
          }
        }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}";

const METAOBJECTS_QUERY: &str = "\
query Metaobjects($type: String!, $first: Int!, $after: String) {
  metaobjects(type: $type, first: $first, after: $after) {
    edges {
      node {
        id
        handle
        type
        updatedAt
        fields { key value }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}";

static CATALOG: &[Resource] = &[
    Resource {
        name: "orders",
        table: "orders",
        kind: FetchKind::Rest {
            path: "orders",
            envelope: "orders",
        },
        key_field: "id",
        key_type: ColumnType::BigInt,
        updated_at_field: "updated_at",
        required_scope: "read_orders",
        extra_query: &[("status", "any")],
    },
    Resource {
        name: "customers",
        table: "customers",
        kind: FetchKind::Rest {
            path: "customers",
            envelope: "customers",
        },
        key_field: "id",
        key_type: ColumnType::BigInt,
        updated_at_field: "updated_at",
        required_scope: "read_customers",
        extra_query: &[],
    },
    Resource {
        name: "products",
        table: "products",
        kind: FetchKind::Rest {
            path: "products",
            envelope: "products",
        },
        key_field: "id",
        key_type: ColumnType::BigInt,
        updated_at_field: "updated_at",
        required_scope: "read_products",
        extra_query: &[],
    },
    Resource {
        name: "locations",
        table: "locations",
        kind: FetchKind::Rest {
            path: "locations",
            envelope: "locations",
        },
        key_field: "id",
        key_type: ColumnType::BigInt,
        updated_at_field: "updated_at",
        required_scope: "read_locations",
        extra_query: &[],
    },
    Resource {
        name: "pages",
        table: "pages",
        kind: FetchKind::Rest {
            path: "pages",
            envelope: "pages",
        },
        key_field: "id",
        key_type: ColumnType::BigInt,
        updated_at_field: "updated_at",
        required_scope: "read_content",
        extra_query: &[],
    },
    Resource {
        name: "blogs",
        table: "blogs",
        kind: FetchKind::Rest {
            path: "blogs",
            envelope: "blogs",
        },
        key_field: "id",
        key_type: ColumnType::BigInt,
        updated_at_field: "updated_at",
        required_scope: "read_content",
        extra_query: &[],
    },
    Resource {
        name: "articles",
        table: "articles",
        kind: FetchKind::Rest {
            path: "articles",
            envelope: "articles",
        },
        key_field: "id",
        key_type: ColumnType::BigInt,
        updated_at_field: "updated_at",
        required_scope: "read_content",
        extra_query: &[],
    },
    Resource {
        name: "inventory_levels",
        table: "inventory_levels",
        kind: FetchKind::Graphql {
            root: "inventoryItems",
            query: INVENTORY_ITEMS_QUERY,
            filterable: true,
            per_type: false,
        },
        key_field: "id",
        key_type: ColumnType::Text,
        updated_at_field: "updatedAt",
        required_scope: "read_inventory",
        extra_query: &[],
    },
    Resource {
        name: "metaobjects",
        table: "metaobjects",
        kind: FetchKind::Graphql {
            root: "metaobjects",
            query: METAOBJECTS_QUERY,
            filterable: false,
            per_type: true,
        },
        key_field: "id",
        key_type: ColumnType::Text,
        updated_at_field: "updatedAt",
        required_scope: "read_metaobjects",
        extra_query: &[],
    },
];

/// All configured resources, in processing order.
pub fn catalog() -> &'static [Resource] {
    CATALOG
}

pub fn find(name: &str) -> Option<&'static Resource> {
    CATALOG.iter().find(|r| r.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nine_resources_with_unique_names() {
        assert_eq!(catalog().len(), 9);
        let mut names: Vec<_> = catalog().iter().map(|r| r.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn every_resource_names_its_scope() {
        for resource in catalog() {
            assert!(
                resource.required_scope.starts_with("read_"),
                "{} has scope {}",
                resource.name,
                resource.required_scope
            );
        }
    }

    #[test]
    fn find_known_and_unknown() {
        assert!(find("orders").is_some());
        assert!(find("checkouts").is_none());
    }

    #[test]
    fn graphql_resources_use_camel_case_updated_at() {
        for resource in catalog() {
            match resource.kind {
                FetchKind::Graphql { .. } => assert_eq!(resource.updated_at_field, "updatedAt"),
                FetchKind::Rest { .. } => assert_eq!(resource.updated_at_field, "updated_at"),
            }
        }
    }
}
