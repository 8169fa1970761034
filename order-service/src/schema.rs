diesel::table! {
    orders (id) {
        id -> Int4,
        user_id -> Int4,
        product_id -> Int4,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}
