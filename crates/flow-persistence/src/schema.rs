// Esquema Diesel compartido por SQLite y Postgres.
// Tablas: processes, tasks, join_arrivals, process_locks
// Las marcas de tiempo se guardan en microsegundos (BigInt) y los UUID como
// texto.
use diesel::allow_tables_to_appear_in_same_query;
diesel::table! {
    processes (id) {
        id -> Text,
        flow -> Text,
        status -> Text,
        created_at_ts -> BigInt,
        finished_at_ts -> Nullable<BigInt>,
        created_by -> Nullable<Text>,
        payload -> Text,
        fingerprint -> Text,
    }
}
diesel::table! {
    tasks (id) {
        id -> Text,
        seq -> BigInt,
        process_id -> Text,
        flow -> Text,
        node -> Text,
        status -> Text,
        owner -> Nullable<Text>,
        created_at_ts -> BigInt,
        started_at_ts -> Nullable<BigInt>,
        finished_at_ts -> Nullable<BigInt>,
        comment -> Nullable<Text>,
        previous -> Text,
    }
}
diesel::table! {
    join_arrivals (process_id, join_node, source) {
        process_id -> Text,
        join_node -> Text,
        source -> Text,
        position -> BigInt,
    }
}
diesel::table! {
    process_locks (process_id) {
        process_id -> Text,
    }
}
allow_tables_to_appear_in_same_query!(processes, tasks, join_arrivals, process_locks);
