diesel::table! {
    inventory (id) {
        id -> Int4,
        quantity -> Int4,
        description -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}
