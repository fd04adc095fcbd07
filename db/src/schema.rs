table! {
    channels (id) {
        id -> Text,
        customer_id -> Text,
        switch_id -> Text,
        name -> Text,
        tech -> Text,
        channel_type -> Text,
        sip_call_id -> Nullable<Text>,
        sip_transport -> Nullable<Text>,
        src_name -> Nullable<Text>,
        src_number -> Nullable<Text>,
        dst_name -> Nullable<Text>,
        dst_number -> Nullable<Text>,
        state -> Text,
        data -> Nullable<Jsonb>,
        stasis_name -> Nullable<Text>,
        stasis_data -> Nullable<Jsonb>,
        bridge_id -> Nullable<Text>,
        playback_id -> Nullable<Text>,
        direction -> Text,
        mute_direction -> Text,
        hangup_cause -> Nullable<Text>,
        tm_create -> Timestamptz,
        tm_update -> Nullable<Timestamptz>,
        tm_answer -> Nullable<Timestamptz>,
        tm_ringing -> Nullable<Timestamptz>,
        tm_end -> Nullable<Timestamptz>,
        tm_delete -> Nullable<Timestamptz>,
    }
}

table! {
    calls (id) {
        id -> Text,
        customer_id -> Text,
        channel_id -> Text,
        bridge_id -> Nullable<Text>,
        status -> Text,
        direction -> Text,
        source -> Nullable<Jsonb>,
        destination -> Nullable<Jsonb>,
        action_id -> Nullable<Text>,
        master_call_id -> Nullable<Text>,
        chained_call_ids -> Nullable<Jsonb>,
        recording_id -> Nullable<Text>,
        recording_ids -> Nullable<Jsonb>,
        external_media_id -> Nullable<Text>,
        confbridge_id -> Nullable<Text>,
        groupcall_id -> Nullable<Text>,
        mute_direction -> Text,
        hangup_by -> Nullable<Text>,
        hangup_reason -> Nullable<Text>,
        dialroute_id -> Nullable<Text>,
        dialroutes -> Nullable<Jsonb>,
        tm_create -> Timestamptz,
        tm_update -> Nullable<Timestamptz>,
        tm_progressing -> Nullable<Timestamptz>,
        tm_ringing -> Nullable<Timestamptz>,
        tm_hangup -> Nullable<Timestamptz>,
        tm_delete -> Nullable<Timestamptz>,
    }
}

table! {
    bridges (id) {
        id -> Text,
        customer_id -> Text,
        switch_id -> Text,
        name -> Text,
        tech -> Text,
        channel_ids -> Nullable<Jsonb>,
        reference_type -> Text,
        reference_id -> Nullable<Text>,
        tm_create -> Timestamptz,
        tm_update -> Nullable<Timestamptz>,
        tm_delete -> Nullable<Timestamptz>,
    }
}

table! {
    confbridges (id) {
        id -> Text,
        customer_id -> Text,
        status -> Text,
        bridge_id -> Nullable<Text>,
        channel_call_ids -> Nullable<Jsonb>,
        recording_id -> Nullable<Text>,
        recording_ids -> Nullable<Jsonb>,
        external_media_id -> Nullable<Text>,
        tm_create -> Timestamptz,
        tm_update -> Nullable<Timestamptz>,
        tm_delete -> Nullable<Timestamptz>,
    }
}

table! {
    groupcalls (id) {
        id -> Text,
        customer_id -> Text,
        status -> Text,
        source -> Nullable<Jsonb>,
        destinations -> Nullable<Jsonb>,
        master_call_id -> Nullable<Text>,
        master_groupcall_id -> Nullable<Text>,
        ring_method -> Text,
        answer_method -> Text,
        answer_call_id -> Nullable<Text>,
        answer_groupcall_id -> Nullable<Text>,
        call_ids -> Nullable<Jsonb>,
        groupcall_ids -> Nullable<Jsonb>,
        call_count -> BigInt,
        groupcall_count -> BigInt,
        dial_index -> BigInt,
        tm_create -> Timestamptz,
        tm_update -> Nullable<Timestamptz>,
        tm_delete -> Nullable<Timestamptz>,
    }
}

table! {
    recordings (id) {
        id -> Text,
        customer_id -> Text,
        reference_type -> Text,
        reference_id -> Text,
        status -> Text,
        format -> Text,
        recording_name -> Text,
        filenames -> Nullable<Jsonb>,
        switch_id -> Nullable<Text>,
        channel_ids -> Nullable<Jsonb>,
        tm_start -> Nullable<Timestamptz>,
        tm_end -> Nullable<Timestamptz>,
        tm_create -> Timestamptz,
        tm_update -> Nullable<Timestamptz>,
        tm_delete -> Nullable<Timestamptz>,
    }
}

table! {
    external_medias (id) {
        id -> Text,
        customer_id -> Text,
        switch_id -> Text,
        channel_id -> Text,
        reference_type -> Text,
        reference_id -> Text,
        encapsulation -> Text,
        transport -> Text,
        format -> Text,
        external_host -> Text,
        local_ip -> Text,
        local_port -> BigInt,
        tm_create -> Timestamptz,
        tm_update -> Nullable<Timestamptz>,
        tm_delete -> Nullable<Timestamptz>,
    }
}
